use hdc_core::{Tab, TabKind, TabSnapshot, OVERVIEW_TAB_ID, PARAM_ESCALATION_ID};
use hdc_storage::SnapshotStore;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TAB_SNAPSHOT_KEY: &str = "workspace.tabs";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TabError {
    #[error("tab registry is not initialized")]
    NotInitialized,
}

/// Decides whether a restored tab still points at something that exists.
pub trait TabResolver {
    fn resolves(&self, tab: &Tab) -> bool;
}

impl<F> TabResolver for F
where
    F: Fn(&Tab) -> bool,
{
    fn resolves(&self, tab: &Tab) -> bool {
        self(tab)
    }
}

/// Restore policy used when nothing better is known about the backend.
///
/// Chat tabs never survive a restart: the live session they were bound to is rebuilt
/// from push events, so a restored chat tab would always be stale.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTabResolver;

impl TabResolver for DefaultTabResolver {
    fn resolves(&self, tab: &Tab) -> bool {
        match tab.kind {
            TabKind::Overview => tab.id == OVERVIEW_TAB_ID,
            TabKind::Case | TabKind::Email | TabKind::Notes => {
                tab.param(PARAM_ESCALATION_ID).is_some()
            }
            TabKind::Chat => false,
            TabKind::Custom => !tab.id.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub dropped: Vec<String>,
    pub corrupt: bool,
    pub fell_back_to_default: bool,
}

pub struct TabRegistry<S> {
    store: S,
    tabs: Vec<Tab>,
    active_tab_id: Option<String>,
    initialized: bool,
}

impl<S: SnapshotStore> TabRegistry<S> {
    pub fn new(store: S) -> Self {
        let snapshot = TabSnapshot::default();
        Self {
            store,
            tabs: snapshot.tabs,
            active_tab_id: snapshot.active_tab_id,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Loads the last persisted snapshot, or the default overview-only state.
    ///
    /// Calling this again after a successful init is a no-op.
    pub fn init(&mut self, resolver: &dyn TabResolver) -> RestoreReport {
        if self.initialized {
            return RestoreReport {
                restored: self.tabs.len(),
                ..RestoreReport::default()
            };
        }

        let mut report = RestoreReport::default();
        let loaded = match self.store.load(TAB_SNAPSHOT_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<TabSnapshot>(&raw) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    warn!(event = "tab_snapshot_corrupt", error = %err);
                    report.corrupt = true;
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(event = "tab_snapshot_load_failed", error = %err);
                report.corrupt = true;
                None
            }
        };

        let restored = match loaded {
            Some(snapshot) => {
                let original = snapshot.clone();
                let sanitized = sanitize_snapshot(snapshot, resolver, &mut report.dropped);
                let changed = sanitized != original;
                (sanitized, changed)
            }
            None => {
                report.fell_back_to_default = true;
                (TabSnapshot::default(), report.corrupt)
            }
        };

        let (snapshot, needs_write) = restored;
        if snapshot == TabSnapshot::default() {
            report.fell_back_to_default = true;
        }
        self.tabs = snapshot.tabs;
        self.active_tab_id = snapshot.active_tab_id;
        self.initialized = true;
        report.restored = self.tabs.len();

        if needs_write {
            self.persist();
        }
        info!(
            event = "tab_registry_initialized",
            restored = report.restored,
            dropped = report.dropped.len(),
            corrupt = report.corrupt
        );
        report
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn get(&self, id: &str) -> Option<&Tab> {
        self.tabs.iter().find(|tab| tab.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn active_tab_id(&self) -> Option<&str> {
        self.active_tab_id.as_deref()
    }

    pub fn active_tab(&self) -> Option<&Tab> {
        self.active_tab_id.as_deref().and_then(|id| self.get(id))
    }

    pub fn snapshot(&self) -> TabSnapshot {
        TabSnapshot {
            tabs: self.tabs.clone(),
            active_tab_id: self.active_tab_id.clone(),
        }
    }

    /// Inserts the tab unless its id is already open; either way it becomes active.
    pub fn open(&mut self, tab: Tab) -> Result<&Tab, TabError> {
        self.ensure_initialized()?;

        let target_id = if tab.kind == TabKind::Overview {
            OVERVIEW_TAB_ID.to_string()
        } else {
            tab.id.clone()
        };
        if !self.contains(&target_id) {
            debug!(event = "tab_opened", tab_id = %target_id, kind = %tab.kind);
            self.tabs.push(tab);
        }
        self.active_tab_id = Some(target_id.clone());
        self.persist();

        Ok(self
            .tabs
            .iter()
            .find(|tab| tab.id == target_id)
            .unwrap_or(&self.tabs[0]))
    }

    /// Returns false for unknown ids.
    pub fn activate(&mut self, id: &str) -> Result<bool, TabError> {
        self.ensure_initialized()?;
        if !self.contains(id) {
            return Ok(false);
        }
        if self.active_tab_id.as_deref() != Some(id) {
            self.active_tab_id = Some(id.to_string());
            self.persist();
        }
        Ok(true)
    }

    pub fn close(&mut self, id: &str) -> Result<bool, TabError> {
        self.ensure_initialized()?;
        let Some(index) = self.tabs.iter().position(|tab| tab.id == id) else {
            return Ok(false);
        };
        if !self.tabs[index].closable || self.tabs[index].is_overview() {
            return Ok(false);
        }

        self.tabs.remove(index);
        if self.active_tab_id.as_deref() == Some(id) {
            let next = self
                .tabs
                .get(index)
                .or_else(|| index.checked_sub(1).and_then(|left| self.tabs.get(left)))
                .map(|tab| tab.id.clone())
                .unwrap_or_else(|| OVERVIEW_TAB_ID.to_string());
            self.active_tab_id = Some(next);
        }
        self.persist();
        Ok(true)
    }

    /// Keeps `id` and the overview tab. Unknown ids leave the registry untouched.
    pub fn close_others(&mut self, id: &str) -> Result<bool, TabError> {
        self.ensure_initialized()?;
        if !self.contains(id) {
            return Ok(false);
        }
        self.tabs.retain(|tab| tab.id == id || tab.is_overview());
        self.active_tab_id = Some(id.to_string());
        self.persist();
        Ok(true)
    }

    pub fn close_all(&mut self) -> Result<(), TabError> {
        self.ensure_initialized()?;
        let snapshot = TabSnapshot::default();
        self.tabs = snapshot.tabs;
        self.active_tab_id = snapshot.active_tab_id;
        self.persist();
        Ok(())
    }

    /// Lets the owner of a tab's content rename it or merge new params into it.
    pub fn patch(
        &mut self,
        id: &str,
        title: Option<String>,
        params: BTreeMap<String, String>,
    ) -> Result<bool, TabError> {
        self.ensure_initialized()?;
        let Some(tab) = self.tabs.iter_mut().find(|tab| tab.id == id) else {
            return Ok(false);
        };
        if let Some(title) = title {
            tab.title = title;
        }
        tab.params.extend(params);
        self.persist();
        Ok(true)
    }

    /// Drops tabs whose backing record turned out to be gone. The overview always stays.
    pub fn discard(&mut self, ids: &[String]) -> Result<usize, TabError> {
        self.ensure_initialized()?;
        let before = self.tabs.len();
        self.tabs
            .retain(|tab| tab.is_overview() || !ids.iter().any(|id| id == &tab.id));
        let removed = before - self.tabs.len();
        if removed == 0 {
            return Ok(0);
        }

        let stale = self
            .active_tab_id
            .as_deref()
            .map_or(true, |id| !self.contains(id));
        if stale {
            self.active_tab_id = Some(OVERVIEW_TAB_ID.to_string());
        }
        self.persist();
        Ok(removed)
    }

    fn ensure_initialized(&self) -> Result<(), TabError> {
        if self.initialized {
            Ok(())
        } else {
            Err(TabError::NotInitialized)
        }
    }

    fn persist(&self) {
        let raw = match serde_json::to_string(&self.snapshot()) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(event = "tab_snapshot_encode_failed", error = %err);
                return;
            }
        };
        if let Err(err) = self.store.save(TAB_SNAPSHOT_KEY, &raw) {
            warn!(event = "tab_snapshot_save_failed", error = %err);
        }
    }
}

fn sanitize_snapshot(
    snapshot: TabSnapshot,
    resolver: &dyn TabResolver,
    dropped: &mut Vec<String>,
) -> TabSnapshot {
    let mut seen = HashSet::new();
    let mut tabs = Vec::with_capacity(snapshot.tabs.len() + 1);
    for tab in snapshot.tabs {
        if !seen.insert(tab.id.clone()) {
            debug!(event = "tab_restore_duplicate", tab_id = %tab.id);
            continue;
        }
        if !resolver.resolves(&tab) {
            debug!(event = "tab_restore_dropped", tab_id = %tab.id, kind = %tab.kind);
            dropped.push(tab.id);
            continue;
        }
        tabs.push(tab);
    }

    if tabs.is_empty() {
        return TabSnapshot::default();
    }

    match tabs.iter().position(Tab::is_overview) {
        Some(index) => {
            tabs[index].closable = false;
            if index != 0 {
                let overview = tabs.remove(index);
                tabs.insert(0, overview);
            }
        }
        None => tabs.insert(0, Tab::overview()),
    }

    let active_tab_id = snapshot
        .active_tab_id
        .filter(|id| tabs.iter().any(|tab| &tab.id == id))
        .or_else(|| Some(OVERVIEW_TAB_ID.to_string()));

    TabSnapshot {
        tabs,
        active_tab_id,
    }
}
