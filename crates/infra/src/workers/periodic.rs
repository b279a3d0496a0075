use std::fmt::Display;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::token::CancellationToken;

/// Run `tick` every `interval` on the calling thread until `token` is cancelled.
///
/// Tick errors are logged and the loop carries on with the next tick. The
/// interval is measured from the start of a tick, so a slow tick is followed
/// immediately by the next one. A panicking tick unwinds out of the loop; run
/// it under a `Supervisor` to have it restarted.
pub fn run_every<F, E>(name: &str, interval: Duration, token: &CancellationToken, mut tick: F)
where
    F: FnMut() -> Result<(), E>,
    E: Display,
{
    info!(worker = %name, interval_ms = interval.as_millis() as u64, "worker started");
    while !token.is_cancelled() {
        let started = Instant::now();
        match tick() {
            Ok(()) => debug!(worker = %name, "tick finished"),
            Err(err) => error!(worker = %name, error = %err, "tick failed"),
        }
        let remaining = interval.saturating_sub(started.elapsed());
        if token.wait(remaining) {
            break;
        }
    }
    info!(worker = %name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn ticks_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let worker = {
            let ticks = Arc::clone(&ticks);
            let token = token.clone();
            thread::spawn(move || {
                run_every("ticker", Duration::from_millis(5), &token, || -> Result<(), String> {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };

        thread::sleep(Duration::from_millis(60));
        token.cancel();
        worker.join().unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");

        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn tick_errors_do_not_stop_the_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let worker = {
            let ticks = Arc::clone(&ticks);
            let token = token.clone();
            thread::spawn(move || {
                run_every("flaky", Duration::from_millis(1), &token, || {
                    let n = ticks.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 { Err("boom") } else { Ok(()) }
                })
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!worker.is_finished());
        token.cancel();
        worker.join().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }
}
