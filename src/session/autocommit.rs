use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type CommitAction = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

enum Signal {
    Touch(String),
    Stop,
}

/// Debounced trigger for committing workspace history on top of file
/// changes. `schedule_commit` never blocks; rapid calls within the quiet
/// window collapse into a single commit attributed to the last actor.
pub struct AutoCommitScheduler {
    tx: mpsc::UnboundedSender<Signal>,
    workspace: PathBuf,
    git_repo: Arc<AtomicBool>,
}

impl AutoCommitScheduler {
    pub fn new(workspace: PathBuf, debounce: Duration) -> Self {
        let git_repo = Arc::new(AtomicBool::new(false));
        let action = git_commit_action(workspace.clone(), git_repo.clone());
        Self::with_action(workspace, git_repo, debounce, action)
    }

    fn with_action(
        workspace: PathBuf,
        git_repo: Arc<AtomicBool>,
        debounce: Duration,
        action: CommitAction,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_debounce_loop(rx, debounce, action));
        Self {
            tx,
            workspace,
            git_repo,
        }
    }

    /// Idempotent setup; inspects whether the workspace is a git tree.
    pub async fn initialize(&self) {
        let is_repo = tokio::fs::metadata(self.workspace.join(".git"))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        self.git_repo.store(is_repo, Ordering::Relaxed);
        debug!(
            "Auto-commit initialized for {:?} (git repo: {})",
            self.workspace, is_repo
        );
    }

    /// Fire-and-forget; the debounce task owns all waiting.
    pub fn schedule_commit(&self, user_id: &str) {
        let _ = self.tx.send(Signal::Touch(user_id.to_string()));
    }

    /// Cancel any pending commit timer. No final commit is flushed; the
    /// workspace archive uploaded on cleanup captures the final state.
    pub fn cleanup(&self) {
        let _ = self.tx.send(Signal::Stop);
    }
}

async fn run_debounce_loop(
    mut rx: mpsc::UnboundedReceiver<Signal>,
    debounce: Duration,
    action: CommitAction,
) {
    loop {
        // Wait for the first touch of a burst.
        let mut user = match rx.recv().await {
            Some(Signal::Touch(user)) => user,
            Some(Signal::Stop) | None => return,
        };
        // Then absorb further touches until the quiet window elapses.
        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    action(user).await;
                    break;
                }
                signal = rx.recv() => match signal {
                    Some(Signal::Touch(next)) => user = next,
                    Some(Signal::Stop) | None => return,
                },
            }
        }
    }
}

fn git_commit_action(workspace: PathBuf, git_repo: Arc<AtomicBool>) -> CommitAction {
    Arc::new(move |user_id: String| {
        let workspace = workspace.clone();
        let git_repo = git_repo.clone();
        Box::pin(async move {
            if !git_repo.load(Ordering::Relaxed) {
                debug!("Workspace {:?} is not a git tree, skipping commit", workspace);
                return;
            }
            if let Err(e) = run_git_commit(&workspace, &user_id).await {
                warn!("Auto-commit failed for {:?}: {}", workspace, e);
            }
        })
    })
}

async fn run_git_commit(workspace: &Path, user_id: &str) -> Result<(), std::io::Error> {
    let add = tokio::process::Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(["add", "-A"])
        .output()
        .await?;
    if !add.status.success() {
        warn!(
            "git add failed in {:?}: {}",
            workspace,
            String::from_utf8_lossy(&add.stderr)
        );
        return Ok(());
    }
    let message = format!("Auto-commit: workspace changes by {}", user_id);
    let commit = tokio::process::Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(["commit", "-m", &message])
        .output()
        .await?;
    if commit.status.success() {
        debug!("Auto-committed workspace {:?} for {}", workspace, user_id);
    } else {
        // "nothing to commit" lands here too; not worth more than a debug line.
        debug!(
            "git commit skipped in {:?}: {}",
            workspace,
            String::from_utf8_lossy(&commit.stderr)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_scheduler(
        debounce: Duration,
    ) -> (AutoCommitScheduler, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<String>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let users = Arc::new(std::sync::Mutex::new(Vec::new()));
        let action: CommitAction = {
            let count = count.clone();
            let users = users.clone();
            Arc::new(move |user: String| {
                count.fetch_add(1, Ordering::SeqCst);
                users.lock().unwrap().push(user);
                Box::pin(async {})
            })
        };
        let scheduler = AutoCommitScheduler::with_action(
            PathBuf::from("."),
            Arc::new(AtomicBool::new(false)),
            debounce,
            action,
        );
        (scheduler, count, users)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_schedules_collapse_into_one_commit() {
        let (scheduler, count, users) = counting_scheduler(Duration::from_secs(2));

        for _ in 0..5 {
            scheduler.schedule_commit("u1");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        scheduler.schedule_commit("u2");
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        // The collapsed commit is attributed to the last actor of the burst.
        assert_eq!(users.lock().unwrap().as_slice(), ["u2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_commit_separately() {
        let (scheduler, count, _) = counting_scheduler(Duration::from_secs(2));

        scheduler.schedule_commit("u1");
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.schedule_commit("u1");
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_the_pending_commit() {
        let (scheduler, count, _) = counting_scheduler(Duration::from_secs(2));

        scheduler.schedule_commit("u1");
        scheduler.cleanup();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        // A second cleanup is harmless.
        scheduler.cleanup();
    }
}
