//! Control of the managed service around offline operations.

use crate::events::{HookDecision, LifecycleHook, OperationEvent};
use anyhow::{anyhow, Context, Result};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strongbox_lib::config::HostConfig;
use tracing::{debug, error, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause/resume interface of the managed service.
pub trait HostControl: Send + Sync {
    /// Stops the service so its files are quiescent.
    fn hold(&self) -> Result<()>;
    /// Brings the service back after [`HostControl::hold`].
    fn unhold(&self) -> Result<()>;
    fn is_running(&self) -> bool;
}

/// Host used when no service is managed.
#[derive(Debug, Default)]
pub struct DetachedHost;

impl HostControl for DetachedHost {
    fn hold(&self) -> Result<()> {
        Ok(())
    }

    fn unhold(&self) -> Result<()> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        false
    }
}

/// Host driven by shell commands from the `[host]` configuration section.
///
/// Without a status command the service is assumed to be running unless
/// this host currently holds it.
pub struct CommandHost {
    hold_command: Option<String>,
    unhold_command: Option<String>,
    status_command: Option<String>,
    held: AtomicBool,
}

impl CommandHost {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            hold_command: config.hold_command.clone(),
            unhold_command: config.unhold_command.clone(),
            status_command: config.status_command.clone(),
            held: AtomicBool::new(false),
        }
    }

    /// Whether any command is configured at all.
    pub fn is_configured(config: &HostConfig) -> bool {
        config.hold_command.is_some() || config.unhold_command.is_some()
    }

    fn run(command: &str) -> Result<bool> {
        debug!("Running host command: {}", command);
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("Failed to execute '{}'", command))?;
        Ok(status.success())
    }
}

impl HostControl for CommandHost {
    fn hold(&self) -> Result<()> {
        if let Some(ref command) = self.hold_command {
            if !Self::run(command)? {
                return Err(anyhow!("Hold command '{}' failed", command));
            }
        }
        self.held.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unhold(&self) -> Result<()> {
        if let Some(ref command) = self.unhold_command {
            if !Self::run(command)? {
                return Err(anyhow!("Unhold command '{}' failed", command));
            }
        }
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        match self.status_command {
            Some(ref command) => match Self::run(command) {
                Ok(running) => running,
                Err(e) => {
                    warn!("Status command failed, assuming service is stopped: {:#}", e);
                    false
                }
            },
            None => !self.held.load(Ordering::SeqCst),
        }
    }
}

/// Lifecycle hook that holds the managed service before an offline
/// operation and resumes it afterwards.
///
/// The service stays held between consecutive offline operations, and is only
/// resumed if this gate was the one that held it.
pub struct HostGate {
    host: Arc<dyn HostControl>,
    stop_timeout: Duration,
    held: AtomicBool,
}

impl HostGate {
    pub fn new(host: Arc<dyn HostControl>, stop_timeout: Duration) -> Self {
        Self {
            host,
            stop_timeout,
            held: AtomicBool::new(false),
        }
    }

    fn wait_for_stop(&self) -> bool {
        let deadline = Instant::now() + self.stop_timeout;
        loop {
            if !self.host.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
    }
}

impl LifecycleHook for HostGate {
    fn name(&self) -> &str {
        "host-gate"
    }

    fn before_start(&self, event: &OperationEvent) -> HookDecision {
        if !event.offline || !self.host.is_running() {
            return HookDecision::Allow;
        }

        info!("Holding managed service for offline operation {}", event.uid);
        if let Err(e) = self.host.hold() {
            error!("Failed to hold managed service: {:#}", e);
            return HookDecision::Deny(format!("{:#}", e));
        }
        self.held.store(true, Ordering::SeqCst);

        if self.wait_for_stop() {
            HookDecision::Allow
        } else {
            HookDecision::Deny(format!(
                "service still running {}s after hold",
                self.stop_timeout.as_secs()
            ))
        }
    }

    fn after_finish(&self, event: &OperationEvent, next_offline: Option<bool>) {
        if next_offline == Some(true) {
            debug!("Keeping managed service held for the next offline operation");
            return;
        }
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Resuming managed service after operation {}", event.uid);
        if let Err(e) = self.host.unhold() {
            error!("Failed to resume managed service: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHost {
        running: AtomicBool,
        calls: Mutex<Vec<&'static str>>,
        fail_hold: bool,
    }

    impl HostControl for FakeHost {
        fn hold(&self) -> Result<()> {
            self.calls.lock().unwrap().push("hold");
            if self.fail_hold {
                return Err(anyhow!("refused"));
            }
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn unhold(&self) -> Result<()> {
            self.calls.lock().unwrap().push("unhold");
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    fn running_host(fail_hold: bool) -> Arc<FakeHost> {
        let host = FakeHost {
            fail_hold,
            ..Default::default()
        };
        host.running.store(true, Ordering::SeqCst);
        Arc::new(host)
    }

    #[test]
    fn test_online_operations_pass_through() {
        let host = running_host(false);
        let gate = HostGate::new(host.clone(), Duration::from_millis(200));
        let event = OperationEvent::pre_start("u1", "world", false);

        assert_eq!(gate.before_start(&event), HookDecision::Allow);
        gate.after_finish(&event, None);
        assert!(host.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_offline_operation_holds_and_resumes() {
        let host = running_host(false);
        let gate = HostGate::new(host.clone(), Duration::from_millis(200));
        let event = OperationEvent::pre_start("u1", "world", true);

        assert_eq!(gate.before_start(&event), HookDecision::Allow);
        assert!(!host.is_running());
        gate.after_finish(&event, None);
        assert!(host.is_running());
        assert_eq!(*host.calls.lock().unwrap(), vec!["hold", "unhold"]);
    }

    #[test]
    fn test_stays_held_between_offline_operations() {
        let host = running_host(false);
        let gate = HostGate::new(host.clone(), Duration::from_millis(200));
        let first = OperationEvent::pre_start("u1", "world", true);
        let second = OperationEvent::pre_start("u2", "world", true);

        gate.before_start(&first);
        gate.after_finish(&first, Some(true));
        assert!(!host.is_running());

        // Service is already stopped: no second hold.
        assert_eq!(gate.before_start(&second), HookDecision::Allow);
        gate.after_finish(&second, None);
        assert_eq!(*host.calls.lock().unwrap(), vec!["hold", "unhold"]);
    }

    #[test]
    fn test_failed_hold_denies_start() {
        let host = running_host(true);
        let gate = HostGate::new(host.clone(), Duration::from_millis(200));
        let event = OperationEvent::pre_start("u1", "world", true);

        assert!(matches!(gate.before_start(&event), HookDecision::Deny(_)));
        gate.after_finish(&event, None);
        assert_eq!(*host.calls.lock().unwrap(), vec!["hold"]);
    }

    #[test]
    fn test_command_host_tracks_hold_state() {
        let host = CommandHost::new(&HostConfig {
            hold_command: Some("true".to_string()),
            unhold_command: Some("true".to_string()),
            status_command: None,
        });
        assert!(host.is_running());
        host.hold().unwrap();
        assert!(!host.is_running());
        host.unhold().unwrap();
        assert!(host.is_running());
    }

    #[test]
    fn test_command_host_reports_failed_hold() {
        let host = CommandHost::new(&HostConfig {
            hold_command: Some("exit 3".to_string()),
            unhold_command: None,
            status_command: Some("false".to_string()),
        });
        assert!(host.hold().is_err());
        assert!(!host.is_running());
    }
}
