use crate::eq::{Command, EqService};
use crate::error::{Error, Result};
use crate::transport::EqHandle;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One thread driving one event-queue service.
pub(crate) struct Worker {
    index: usize,
    local_addr: SocketAddr,
    listener: Option<EqHandle>,
    commands: flume::Sender<Command>,
    shutdown: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(index: usize, mut eq: EqService, interval: Duration) -> Result<Self> {
        let commands = eq.command_sender();
        let local_addr = eq.local_addr();
        let listener = eq.listener();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let join_handle = thread::Builder::new()
            .name(format!("eq-worker-{index}"))
            .spawn(move || {
                tracing::debug!(worker = index, "worker started");
                let mut last_err_log: Option<Instant> = None;
                let mut err_suppressed: u64 = 0;

                while !flag.load(Ordering::Acquire) {
                    if let Err(e) = eq.poll(interval) {
                        // Rate-limited; a broken channel fails every poll.
                        if last_err_log.map_or(true, |t| t.elapsed() >= Duration::from_secs(1)) {
                            tracing::error!(
                                worker = index,
                                error = %e,
                                suppressed = err_suppressed,
                                "poll failed"
                            );
                            err_suppressed = 0;
                            last_err_log = Some(Instant::now());
                        } else {
                            err_suppressed += 1;
                        }
                        thread::sleep(interval);
                    }
                }

                eq.close();
                tracing::debug!(worker = index, "worker stopped");
            })?;

        Ok(Self {
            index,
            local_addr,
            listener,
            commands,
            shutdown,
            join_handle: Some(join_handle),
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn listener(&self) -> Option<EqHandle> {
        self.listener
    }

    /// Send a command carrying a reply channel and wait for the answer.
    pub(crate) fn request<T>(
        &self,
        make: impl FnOnce(flume::Sender<Result<T>>) -> Command,
        timeout: Duration,
    ) -> Result<T> {
        let (tx, rx) = flume::bounded(1);
        self.commands.send(make(tx)).map_err(|_| Error::Closed)?;
        match rx.recv_timeout(timeout) {
            Ok(res) => res,
            Err(flume::RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(flume::RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                tracing::error!(worker = self.index, "worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
