//! The core thread: one registry, one scheduler, one event at a time.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::daemon::protocol::{DaemonRequest, DaemonResponse};
use crate::daemon::registry::DaemonRegistry;
use crate::daemon::scheduler::{Scheduler, Timer};

/// Input to the core thread
#[derive(Debug)]
pub enum Event {
    /// A decoded RPC and where to send its answer
    Request {
        request: DaemonRequest,
        reply: oneshot::Sender<DaemonResponse>,
    },
    /// Re-read sources and saved state (SIGHUP)
    Reload,
    /// Stop the daemon (SIGTERM, SIGINT or the server going away)
    Shutdown,
}

/// Why the core thread stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Nothing was using the daemon at a cleanup pass
    Idle,
    /// A shutdown request or signal
    Requested,
}

pub struct EventLoop {
    registry: DaemonRegistry,
    scheduler: Scheduler,
    sync_delay: Duration,
    cleanup_interval: Duration,
    log_idle_close: Duration,
    exit: Option<ExitReason>,
}

impl EventLoop {
    pub fn new(registry: DaemonRegistry, now: Instant) -> Self {
        let settings = registry.settings();
        let sync_delay = settings.sync_delay;
        let cleanup_interval = settings.cleanup_interval;
        let log_idle_close = settings.log_idle_close;

        let mut scheduler = Scheduler::new();
        scheduler.set(Timer::Cleanup, now + cleanup_interval);

        Self {
            registry,
            scheduler,
            sync_delay,
            cleanup_interval,
            log_idle_close,
            exit: None,
        }
    }

    pub fn registry(&self) -> &DaemonRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    /// Answer one request and schedule the follow-up work it caused.
    pub fn handle_request(&mut self, request: DaemonRequest, now: Instant) -> DaemonResponse {
        let response = self.registry.handle(request);
        if matches!(response, DaemonResponse::ShuttingDown) {
            self.exit = Some(ExitReason::Requested);
        }
        self.after_turn(now);
        response
    }

    pub fn dispatch(&mut self, event: Event, now: Instant) {
        match event {
            Event::Request { request, reply } => {
                let response = self.handle_request(request, now);
                if reply.send(response).is_err() {
                    debug!("Requester went away before the reply was sent");
                }
            }
            Event::Reload => {
                if let Err(e) = self.registry.reload() {
                    error!(error = %e, "Reload failed");
                }
                self.after_turn(now);
            }
            Event::Shutdown => {
                info!("Shutdown requested");
                self.exit = Some(ExitReason::Requested);
            }
        }
    }

    /// Fire the earliest timer due at `now`. Returns whether one fired.
    pub fn fire_next(&mut self, now: Instant) -> bool {
        let Some(timer) = self.scheduler.pop_due(now) else {
            return false;
        };
        debug!(?timer, "Timer fired");
        match timer {
            Timer::Sync(signature) => self.registry.sync_database(&signature),
            Timer::Cleanup => {
                for signature in self.registry.cleanup(now) {
                    self.scheduler.cancel(&Timer::Sync(signature));
                }
                if self.registry.should_exit_idle() {
                    info!("No clients or listeners left, exiting");
                    self.exit = Some(ExitReason::Idle);
                } else {
                    self.scheduler
                        .set(Timer::Cleanup, now + self.cleanup_interval);
                }
            }
            Timer::CloseLog => match self.registry.log().last_write() {
                Some(written) if now.saturating_duration_since(written) < self.log_idle_close => {
                    self.scheduler
                        .set(Timer::CloseLog, written + self.log_idle_close);
                }
                _ => {
                    self.registry.log_mut().close();
                }
            },
        }
        self.after_turn(now);
        true
    }

    /// Arm the timers implied by the state after a turn. A database that
    /// asked for an explicit sync is flushed on the next turn; otherwise a
    /// pending change arms the debounce timer once.
    fn after_turn(&mut self, now: Instant) {
        for db in self.registry.databases_mut() {
            let timer = Timer::Sync(db.signature().clone());
            if db.take_sync_request() {
                self.scheduler.set(timer, now);
            } else if db.sync_pending() {
                self.scheduler.arm(timer, now + self.sync_delay);
            }
        }
        if self.registry.log().is_open() {
            self.scheduler
                .arm(Timer::CloseLog, now + self.log_idle_close);
        }
    }

    /// Run until shutdown or idle exit, then flush everything and answer
    /// whatever is still queued.
    pub fn run(mut self, events: Receiver<Event>) -> ExitReason {
        info!("Core loop started");
        let reason = loop {
            if let Some(reason) = self.exit {
                break reason;
            }
            if self.fire_next(Instant::now()) {
                continue;
            }
            let timeout = self
                .scheduler
                .next_deadline()
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or(self.cleanup_interval);
            match events.recv_timeout(timeout) {
                Ok(event) => self.dispatch(event, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Event channel closed");
                    self.exit = Some(ExitReason::Requested);
                }
            }
        };
        self.finish(&events);
        info!(?reason, "Core loop stopped");
        reason
    }

    fn finish(&mut self, events: &Receiver<Event>) {
        self.scheduler.clear();
        self.registry.shutdown();
        for event in events.try_iter() {
            if let Event::Request { request, reply } = event {
                let _ = reply.send(self.registry.handle(request));
            }
        }
    }
}
