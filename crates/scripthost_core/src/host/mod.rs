//! Embedded interpreter host.
//!
//! # Responsibility
//! - Initialize the interpreter session once, with isolation and output
//!   capture wired in.
//! - Hand out thread contexts bound to the live session.
//! - Tear the session down exactly once.
//!
//! # Invariants
//! - A host owns at most one session; repeated `initialize` calls never
//!   create a second one.
//! - A missing configuration disables scripting and is never fatal.
//! - `shutdown` is terminal: the host never becomes ready again.

pub mod output;
pub mod session;

use crate::config::{ConfigurationError, HostConfig, HostEnvironment};
use log::{debug, info, warn};
use output::{LogChannel, LogCrateChannel};
use session::{InterpreterSession, ThreadContext};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// Observable host lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    Uninitialized,
    Disabled,
    Ready,
    ShutDown,
}

enum HostState {
    Uninitialized,
    Disabled,
    Ready(Arc<InterpreterSession>),
    ShutDown,
}

/// Single-owner handle over the embedded interpreter session.
pub struct InterpreterHost {
    environment: HostEnvironment,
    channel: Arc<dyn LogChannel>,
    state: RwLock<HostState>,
}

impl InterpreterHost {
    /// Creates an uninitialized host that logs script output via `log`.
    pub fn new(environment: HostEnvironment) -> Self {
        Self::with_output_channel(environment, Arc::new(LogCrateChannel))
    }

    /// Creates an uninitialized host with a custom script output channel.
    pub fn with_output_channel(environment: HostEnvironment, channel: Arc<dyn LogChannel>) -> Self {
        Self {
            environment,
            channel,
            state: RwLock::new(HostState::Uninitialized),
        }
    }

    /// Initializes the interpreter session.
    ///
    /// Returns `true` when a session is active after the call.
    ///
    /// # Contract
    /// - Already ready: returns `true` and keeps the existing session; a
    ///   different `module_search_path` is logged and ignored.
    /// - Not configured or invalid configuration: returns `false`, leaves no
    ///   session, and a later call may retry.
    /// - After `shutdown`: always returns `false`.
    pub fn initialize(&self, module_search_path: Option<&str>) -> bool {
        let started_at = Instant::now();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        match &*state {
            HostState::Ready(session) => {
                let requested = module_search_path.map(str::trim).filter(|p| !p.is_empty());
                let active = session.module_search_path().and_then(|p| p.to_str());
                if requested.is_some() && requested != active {
                    warn!(
                        "event=interpreter_init module=host status=ignored reason=already_initialized requested_path={}",
                        requested.unwrap_or_default()
                    );
                } else {
                    debug!(
                        "event=interpreter_init module=host status=noop reason=already_initialized"
                    );
                }
                return true;
            }
            HostState::ShutDown => {
                warn!("event=interpreter_init module=host status=rejected reason=shut_down");
                return false;
            }
            HostState::Uninitialized | HostState::Disabled => {}
        }

        match self.open_session(module_search_path) {
            Ok(session) => {
                info!(
                    "event=interpreter_init module=host status=ok duration_ms={} home={} search_path={} cache_dir={}",
                    started_at.elapsed().as_millis(),
                    session.home_dir().display(),
                    session
                        .module_search_path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    session.cache_dir().display()
                );
                *state = HostState::Ready(Arc::new(session));
                true
            }
            Err(ConfigurationError::NotConfigured) => {
                info!(
                    "event=interpreter_init module=host status=disabled reason={}",
                    ConfigurationError::NotConfigured
                );
                *state = HostState::Disabled;
                false
            }
            Err(err) => {
                warn!(
                    "event=interpreter_init module=host status=error duration_ms={} error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                *state = HostState::Disabled;
                false
            }
        }
    }

    fn open_session(
        &self,
        module_search_path: Option<&str>,
    ) -> Result<InterpreterSession, ConfigurationError> {
        let config = HostConfig::resolve(module_search_path, &self.environment)?;
        std::fs::create_dir_all(&config.cache_dir).map_err(|source| {
            ConfigurationError::CacheDirectory {
                path: config.cache_dir.clone(),
                source,
            }
        })?;
        Ok(InterpreterSession::open(config, self.channel.clone()))
    }

    pub fn phase(&self) -> HostPhase {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            HostState::Uninitialized => HostPhase::Uninitialized,
            HostState::Disabled => HostPhase::Disabled,
            HostState::Ready(_) => HostPhase::Ready,
            HostState::ShutDown => HostPhase::ShutDown,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == HostPhase::Ready
    }

    /// Returns the live session, if any.
    pub fn session(&self) -> Option<Arc<InterpreterSession>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            HostState::Ready(session) => Some(session.clone()),
            _ => None,
        }
    }

    /// Returns a context for the calling thread.
    ///
    /// When the host is not ready the context is detached and every load
    /// through it returns absent.
    pub fn thread_context(&self) -> ThreadContext {
        match self.session() {
            Some(session) => session.thread_context(),
            None => ThreadContext::detached(),
        }
    }

    /// Releases the session and flushes pending script output.
    ///
    /// Callers must quiesce all loads and invocations first.
    pub fn shutdown(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *state, HostState::ShutDown);
        match previous {
            HostState::Ready(session) => {
                session.close();
                info!("event=interpreter_shutdown module=host status=ok");
            }
            HostState::ShutDown => {
                debug!(
                    "event=interpreter_shutdown module=host status=noop reason=already_shut_down"
                );
            }
            HostState::Uninitialized | HostState::Disabled => {
                info!("event=interpreter_shutdown module=host status=ok session=none");
            }
        }
    }
}

impl Drop for InterpreterHost {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let HostState::Ready(session) = state {
            session.close();
        }
    }
}

impl std::fmt::Debug for InterpreterHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterHost")
            .field("environment", &self.environment)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}
