use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::journal::{Journal, JournalError};
use crate::limits::MAX_SETTING_VALUE_LEN;
use crate::model::Event;

/// Persisted administrator settings. The backing store the timezone cache reads from.
pub struct Settings {
    journal: Journal,
    values: DashMap<String, String>,
    write_lock: Mutex<()>,
}

impl Settings {
    pub fn from_events(journal: Journal, events: &[Event]) -> Self {
        let values = DashMap::new();
        for event in events {
            if let Event::SettingChanged { key, value } = event {
                match value {
                    Some(v) => {
                        values.insert(key.clone(), v.clone());
                    }
                    None => {
                        values.remove(key);
                    }
                }
            }
        }
        Self {
            journal,
            values,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    /// All keys with their values, sorted by key.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort();
        out
    }

    /// Persist then apply. `None` removes the key.
    pub async fn set(&self, key: &str, value: Option<String>) -> Result<(), JournalError> {
        if value.as_ref().is_some_and(|v| v.len() > MAX_SETTING_VALUE_LEN) {
            return Err(JournalError("setting value too long".into()));
        }
        let _permit = self.journal.permit().await;
        // Journal order must match apply order for concurrent writers.
        let _guard = self.write_lock.lock().await;
        let event = Event::SettingChanged {
            key: key.to_string(),
            value: value.clone(),
        };
        self.journal.append(&event).await?;
        match value {
            Some(v) => {
                self.values.insert(key.to_string(), v);
            }
            None => {
                self.values.remove(key);
            }
        }
        Ok(())
    }

    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .values
            .iter()
            .map(|e| Event::SettingChanged {
                key: e.key().clone(),
                value: Some(e.value().clone()),
            })
            .collect();
        events.sort_by(|a, b| match (a, b) {
            (Event::SettingChanged { key: ka, .. }, Event::SettingChanged { key: kb, .. }) => ka.cmp(kb),
            _ => std::cmp::Ordering::Equal,
        });
        events
    }
}
