//! File-watch triggers: one `notify` watcher per configured path, mapped to
//! the coarse {add, change, unlink, rename} vocabulary the task template
//! placeholders expect.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::scheduler::RunTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    Add,
    Change,
    Unlink,
    Rename,
}

impl WatchEvent {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Unlink => "unlink",
            Self::Rename => "rename",
        }
    }

    /// `rename` from the underlying OS event is ambiguous, so it is mapped
    /// to every coarse event a consumer might have configured; `change`
    /// notify events only ever mean `change`.
    fn from_notify(kind: &EventKind) -> Vec<WatchEvent> {
        match kind {
            EventKind::Create(_) => vec![WatchEvent::Add],
            EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
                vec![WatchEvent::Add, WatchEvent::Unlink, WatchEvent::Rename]
            }
            EventKind::Modify(_) => vec![WatchEvent::Change],
            EventKind::Remove(_) => vec![WatchEvent::Unlink],
            _ => vec![],
        }
    }
}

pub struct FileWatchConfig {
    pub path: PathBuf,
    pub events: HashSet<WatchEvent>,
    pub task_template: String,
}

/// Fill `{filename}`, `{event}`, `{path}` placeholders in the task template.
fn render_task(template: &str, path: &Path, event: WatchEvent) -> String {
    let filename = path.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
    template
        .replace("{filename}", &filename)
        .replace("{event}", event.as_str())
        .replace("{path}", &path.to_string_lossy())
}

pub struct FileWatchTrigger {
    _watcher: RecommendedWatcher,
}

impl FileWatchTrigger {
    pub fn spawn(config: FileWatchConfig, run_task: RunTask) -> notify::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => error!(error = %e, "file watcher error"),
        })?;
        watcher.watch(&config.path, RecursiveMode::NonRecursive)?;

        let events = config.events.clone();
        let template = config.task_template.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mapped = WatchEvent::from_notify(&event.kind);
                for watch_event in mapped {
                    if !events.contains(&watch_event) {
                        continue;
                    }
                    for path in &event.paths {
                        let task = render_task(&template, path, watch_event);
                        let run_task = run_task.clone();
                        tokio::spawn(async move {
                            if let Err(e) = run_task(task).await {
                                warn!(error = %e, "file-watch trigger task failed");
                            }
                        });
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher })
    }
}

pub struct FileWatchEngine {
    _triggers: Vec<FileWatchTrigger>,
}

impl FileWatchEngine {
    pub fn start(configs: Vec<FileWatchConfig>, run_task: RunTask) -> Self {
        let mut triggers = vec![];
        for config in configs {
            match FileWatchTrigger::spawn(config, Arc::clone(&run_task)) {
                Ok(trigger) => triggers.push(trigger),
                Err(e) => error!(error = %e, "failed to start file watcher"),
            }
        }
        Self { _triggers: triggers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_placeholders() {
        let rendered = render_task("new {event}: {filename} at {path}", Path::new("/tmp/x/note.txt"), WatchEvent::Add);
        assert_eq!(rendered, "new add: note.txt at /tmp/x/note.txt");
    }

    #[test]
    fn rename_maps_to_three_coarse_events() {
        let mapped = WatchEvent::from_notify(&EventKind::Modify(notify::event::ModifyKind::Name(
            notify::event::RenameMode::Any,
        )));
        assert!(mapped.contains(&WatchEvent::Add));
        assert!(mapped.contains(&WatchEvent::Unlink));
        assert!(mapped.contains(&WatchEvent::Rename));
    }

    #[test]
    fn plain_modify_maps_to_change_only() {
        let mapped = WatchEvent::from_notify(&EventKind::Modify(notify::event::ModifyKind::Data(
            notify::event::DataChange::Content,
        )));
        assert_eq!(mapped, vec![WatchEvent::Change]);
    }
}
