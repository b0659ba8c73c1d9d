use anyhow::{anyhow, bail, Result};
use hdc_core::EscalationStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open {
        escalation_id: String,
        case_number: String,
    },
    Close(String),
    CloseOthers(String),
    CloseAll,
    Activate(String),
    Accept(String),
    Dismiss(String),
    End,
    Status {
        escalation_id: String,
        status: EscalationStatus,
    },
    Tabs,
    Pending,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  open <escalation-id> [case-number]   open a case tab
  close <tab-id>                       close a tab
  close-others <tab-id>                keep only this tab and the overview
  close-all                            reset to the overview
  activate <tab-id>                    select a tab
  accept <escalation-id>               take a pending chat
  dismiss <escalation-id>              drop a pending chat
  end                                  end the live chat
  status <escalation-id> <status>      set a case status (open|pending|resolved|closed)
  tabs | pending | help | quit";

/// Parses one stdin line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let mut arg = |name: &str| {
        words
            .next()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("{verb}: missing <{name}>"))
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "open" => Command::Open {
            escalation_id: arg("escalation-id")?,
            case_number: arg("case-number").unwrap_or_default(),
        },
        "close" => Command::Close(arg("tab-id")?),
        "close-others" => Command::CloseOthers(arg("tab-id")?),
        "close-all" => Command::CloseAll,
        "activate" => Command::Activate(arg("tab-id")?),
        "accept" => Command::Accept(arg("escalation-id")?),
        "dismiss" => Command::Dismiss(arg("escalation-id")?),
        "end" => Command::End,
        "status" => {
            let escalation_id = arg("escalation-id")?;
            let status = arg("status")?
                .parse::<EscalationStatus>()
                .map_err(|err| anyhow!(err))?;
            Command::Status {
                escalation_id,
                status,
            }
        }
        "tabs" => Command::Tabs,
        "pending" => Command::Pending,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '{other}' (try 'help')"),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!(
            parse_line("open E42 42").expect("parse"),
            Some(Command::Open {
                escalation_id: "E42".to_string(),
                case_number: "42".to_string(),
            })
        );
        assert_eq!(
            parse_line("  accept   E1 ").expect("parse"),
            Some(Command::Accept("E1".to_string()))
        );
        assert_eq!(
            parse_line("status E1 resolved").expect("parse"),
            Some(Command::Status {
                escalation_id: "E1".to_string(),
                status: EscalationStatus::Resolved,
            })
        );
        assert_eq!(parse_line("close-all").expect("parse"), Some(Command::CloseAll));
    }

    #[test]
    fn case_number_is_optional() {
        assert_eq!(
            parse_line("open E7").expect("parse"),
            Some(Command::Open {
                escalation_id: "E7".to_string(),
                case_number: String::new(),
            })
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_line("   ").expect("parse"), None);
    }

    #[test]
    fn missing_arguments_and_unknown_verbs_fail() {
        let err = parse_line("close").expect_err("missing");
        assert!(err.to_string().contains("<tab-id>"));
        assert!(parse_line("status E1 sideways").is_err());
        assert!(parse_line("launch").is_err());
    }
}
