use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::engine::RuleSet;
use crate::resolver::Transport;

/// Rebuilds the rule set whenever the rules file changes.
pub fn spawn(
    path: PathBuf,
    settings: Settings,
    transport: Arc<dyn Transport>,
    rules: Arc<ArcSwap<RuleSet>>,
) {
    // The watcher is held on a blocking thread; notify delivers on std channels.
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, settings, transport, rules) {
            error!(target = "watcher", error = %err, "rules watcher exited with error");
        }
    });
}

fn run_watcher(
    path: PathBuf,
    settings: Settings,
    transport: Arc<dyn Transport>,
    rules: Arc<ArcSwap<RuleSet>>,
) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "rules watcher started");

    for res in rx {
        match res {
            Ok(_event) => reload(&path, &settings, &transport, &rules),
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Editors often truncate then write, so a failed read is retried briefly
/// before the old rules are kept.
fn reload(
    path: &Path,
    settings: &Settings,
    transport: &Arc<dyn Transport>,
    rules: &Arc<ArcSwap<RuleSet>>,
) {
    let mut retries = 3;
    while retries > 0 {
        match RuleSet::load(path, settings, transport) {
            Ok(new_rules) => {
                let count = new_rules.len();
                rules.store(Arc::new(new_rules));
                info!(target = "watcher", path = %path.display(), rules = count, "rules reloaded");
                return;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(
                        target = "watcher",
                        path = %path.display(),
                        error = %err,
                        "rules reload failed, keeping old rules"
                    );
                } else {
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InvalidRulePolicy;
    use crate::resolver::testing::ScriptedTransport;
    use std::fs;

    #[test]
    fn reload_replaces_rules_and_keeps_old_on_failure() {
        let dir = std::env::temp_dir().join(format!("sentry-dns-watch-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rules.conf");
        fs::write(&path, "block a.example\nlog .*\n").unwrap();

        let settings = Settings {
            on_invalid_rule: InvalidRulePolicy::Abort,
            ..Default::default()
        };
        let transport: Arc<dyn Transport> = Arc::new(ScriptedTransport::new());
        let rules = Arc::new(ArcSwap::from_pointee(RuleSet::default()));

        reload(&path, &settings, &transport, &rules);
        assert_eq!(rules.load().len(), 2);

        fs::write(&path, "this is not a rule\n").unwrap();
        reload(&path, &settings, &transport, &rules);
        assert_eq!(rules.load().len(), 2);

        let _ = fs::remove_dir_all(&dir);
    }
}
