use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// The host's built-in speech facility.
#[async_trait]
pub trait SpeechService: Send + Sync {
    fn is_available(&self) -> bool;

    /// Speak `text` and return once it has been spoken.
    async fn say(&self, text: &str, speed: f32) -> Result<(), EngineError>;
}

type DoneCallback = Box<dyn FnOnce() + Send>;

struct Utterance {
    task: AbortHandle,
    done: Arc<Mutex<Option<DoneCallback>>>,
}

/// Speaks whole strings through a [`SpeechService`].
///
/// There is no pause primitive: [`SystemEngine::pause`] stops the utterance,
/// and resuming means speaking the text again from its start.
pub struct SystemEngine {
    service: Arc<dyn SpeechService>,
    available: AtomicBool,
    current: Mutex<Option<Utterance>>,
}

impl SystemEngine {
    pub fn new(service: Arc<dyn SpeechService>) -> Self {
        let available = service.is_available();
        if !available {
            warn!("No system speech service available");
        }
        Self {
            service,
            available: AtomicBool::new(available),
            current: Mutex::new(None),
        }
    }

    /// Engine backed by the first speech command found on this host.
    pub fn detect() -> Self {
        Self::new(Arc::new(CommandSpeechService::detect()))
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Start speaking `text`, replacing anything in flight.
    ///
    /// `on_done` runs exactly once, when the utterance finishes, fails or is
    /// stopped. If the service is unavailable this does nothing and `on_done`
    /// is dropped without running. Must be called inside a tokio runtime.
    pub fn speak(&self, text: &str, speed: f32, on_done: impl FnOnce() + Send + 'static) {
        if !self.is_available() {
            return;
        }
        self.stop();

        let done: Arc<Mutex<Option<DoneCallback>>> = Arc::new(Mutex::new(Some(Box::new(on_done))));
        let service = self.service.clone();
        let text = text.to_string();
        let finished = done.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = service.say(&text, speed).await {
                warn!(error = %e, "System speech failed");
            }
            fire(&finished);
        });

        *self.current.lock() = Some(Utterance {
            task: task.abort_handle(),
            done,
        });
    }

    /// Cancel the current utterance; its completion callback fires now.
    pub fn stop(&self) {
        let current = self.current.lock().take();
        if let Some(utterance) = current {
            utterance.task.abort();
            fire(&utterance.done);
        }
    }

    pub fn pause(&self) {
        self.stop();
    }

    pub fn release(&self) {
        self.stop();
        self.available.store(false, Ordering::SeqCst);
    }
}

fn fire(done: &Mutex<Option<DoneCallback>>) {
    let callback = done.lock().take();
    if let Some(callback) = callback {
        callback();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostCommand {
    Say(PathBuf),
    SpdSay(PathBuf),
    Espeak(PathBuf),
    PowerShell(PathBuf),
}

/// Speaks through a command-line speech tool found on `PATH`.
#[derive(Debug, Clone)]
pub struct CommandSpeechService {
    command: Option<HostCommand>,
}

impl CommandSpeechService {
    pub fn detect() -> Self {
        let command = if cfg!(target_os = "macos") {
            find_in_path("say").map(HostCommand::Say)
        } else if cfg!(windows) {
            find_in_path("powershell").map(HostCommand::PowerShell)
        } else {
            find_in_path("spd-say")
                .map(HostCommand::SpdSay)
                .or_else(|| find_in_path("espeak-ng").map(HostCommand::Espeak))
                .or_else(|| find_in_path("espeak").map(HostCommand::Espeak))
        };
        match &command {
            Some(cmd) => info!(command = ?cmd, "Using system speech command"),
            None => debug!("No speech command found on PATH"),
        }
        Self { command }
    }

    /// A service that never speaks.
    pub fn unavailable() -> Self {
        Self { command: None }
    }

    fn build(&self, speed: f32) -> Option<(Command, bool)> {
        let speed = speed.max(0.1);
        let (mut cmd, pipe_text) = match self.command.as_ref()? {
            HostCommand::Say(bin) => {
                let mut cmd = Command::new(bin);
                cmd.arg("-r").arg(format!("{}", (175.0 * speed).round() as u32));
                (cmd, true)
            }
            HostCommand::SpdSay(bin) => {
                let mut cmd = Command::new(bin);
                let rate = ((speed - 1.0) * 100.0).round().clamp(-100.0, 100.0) as i32;
                cmd.arg("-w").arg("-r").arg(rate.to_string());
                (cmd, false)
            }
            HostCommand::Espeak(bin) => {
                let mut cmd = Command::new(bin);
                cmd.arg("--stdin")
                    .arg("-s")
                    .arg(format!("{}", (175.0 * speed).round() as u32));
                (cmd, true)
            }
            HostCommand::PowerShell(bin) => {
                let rate = ((speed - 1.0) * 10.0).round().clamp(-10.0, 10.0) as i32;
                let mut cmd = Command::new(bin);
                cmd.arg("-NoProfile").arg("-Command").arg(format!(
                    "Add-Type -AssemblyName System.Speech; \
                     $s = New-Object System.Speech.Synthesis.SpeechSynthesizer; \
                     $s.Rate = {rate}; $s.Speak([Console]::In.ReadToEnd())"
                ));
                (cmd, true)
            }
        };
        cmd.stdout(Stdio::null())
            .stderr(Stdio::null())
            .stdin(if pipe_text { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);
        Some((cmd, pipe_text))
    }
}

#[async_trait]
impl SpeechService for CommandSpeechService {
    fn is_available(&self) -> bool {
        self.command.is_some()
    }

    async fn say(&self, text: &str, speed: f32) -> Result<(), EngineError> {
        let Some((mut cmd, pipe_text)) = self.build(speed) else {
            return Err(EngineError::BackendUnavailable("no speech command".into()));
        };
        if !pipe_text {
            cmd.arg("--").arg(text);
        }

        let mut child = cmd.spawn()?;
        if pipe_text {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(text.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
            }
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(EngineError::Inference(format!(
                "speech command exited with {status}"
            )));
        }
        Ok(())
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        let exe = dir.join(format!("{name}.exe"));
        exe.is_file().then_some(exe)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct Timed {
        available: bool,
        duration: Duration,
        spoken: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SpeechService for Timed {
        fn is_available(&self) -> bool {
            self.available
        }

        async fn say(&self, text: &str, _speed: f32) -> Result<(), EngineError> {
            self.spoken.lock().push(text.to_string());
            tokio::time::sleep(self.duration).await;
            Ok(())
        }
    }

    fn engine(available: bool, secs: u64) -> (SystemEngine, Arc<Timed>) {
        let service = Arc::new(Timed {
            available,
            duration: Duration::from_secs(secs),
            spoken: Mutex::new(Vec::new()),
        });
        (SystemEngine::new(service.clone()), service)
    }

    #[tokio::test(start_paused = true)]
    async fn completion_fires_once() {
        let (engine, service) = engine(true, 2);
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let c = count.clone();
        engine.speak("hello", 1.0, move || {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });
        rx.await.unwrap();
        engine.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(service.spoken.lock().as_slice(), ["hello"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_counts_as_completion() {
        let (engine, _) = engine(true, 60);
        let (tx, rx) = oneshot::channel();
        engine.speak("long text", 1.0, move || {
            let _ = tx.send(());
        });
        tokio::task::yield_now().await;
        engine.pause();
        tokio::time::timeout(Duration::from_millis(10), rx)
            .await
            .expect("stop should complete the utterance")
            .unwrap();
    }

    #[tokio::test]
    async fn unavailable_service_is_a_no_op() {
        let (engine, service) = engine(false, 0);
        assert!(!engine.is_available());
        let (tx, rx) = oneshot::channel::<()>();
        engine.speak("hello", 1.0, move || {
            let _ = tx.send(());
        });
        assert!(rx.await.is_err(), "callback dropped without running");
        assert!(service.spoken.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_utterance_completes_the_previous_one() {
        let (engine, _) = engine(true, 60);
        let (tx1, rx1) = oneshot::channel();
        engine.speak("first", 1.0, move || {
            let _ = tx1.send(());
        });
        engine.speak("second", 1.0, || {});
        rx1.await.unwrap();
        engine.release();
        assert!(!engine.is_available());
    }

    #[test]
    fn unavailable_command_service() {
        let service = CommandSpeechService::unavailable();
        assert!(!service.is_available());
        assert!(service.build(1.0).is_none());
    }
}
