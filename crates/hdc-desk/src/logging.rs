use hdc_workspace::DeskConfig;
use std::{
    env,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "HDC_LOG_LEVEL";

type SharedFile = Arc<Mutex<File>>;

/// Keeps the log file open for the lifetime of the process.
pub struct LogGuard {
    file: Option<SharedFile>,
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<SharedFile>,
}

pub fn init_logging(config: &DeskConfig) -> Option<LogGuard> {
    let level = env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir, &config.agent_id) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let stdout_enabled = config.log_stdout;
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stdout_enabled,
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            let _ = file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap_or_else(PoisonError::into_inner).flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path, agent_id: &str) -> io::Result<LogGuard> {
    if log_dir.as_os_str().is_empty() {
        return Ok(LogGuard { file: None });
    }
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(format!("hdc-desk-{}.log", sanitize_component(agent_id)));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ids_are_safe_file_components() {
        assert_eq!(sanitize_component("agent-7"), "agent-7");
        assert_eq!(sanitize_component("ops/agent 7"), "ops_agent_7");
    }

    #[test]
    fn log_file_is_created_per_agent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let guard = open_log_file(&dir.path().join("logs"), "agent-7").expect("open");
        assert!(guard.file.is_some());
        assert!(dir.path().join("logs").join("hdc-desk-agent-7.log").exists());
    }

    #[test]
    fn empty_log_dir_disables_file_logging() {
        let guard = open_log_file(Path::new(""), "agent-7").expect("open");
        assert!(guard.file.is_none());
    }
}
