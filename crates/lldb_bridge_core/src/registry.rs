//! Live debugger sessions keyed by target pid, with best-effort bundle id
//! aliases. Liveness is checked on every lookup; dead or poisoned sessions
//! are evicted then and there.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::session::{FramedSession, SessionHandle};
use crate::types::{LaunchRequest, OpenAndAttachRequest, SessionSummary};
use crate::{LldbError, Result};

const DETACH_COMMAND: &str = "process detach";

/// Creates ready sessions. Each method returns a session whose startup prompt
/// has been consumed and whose target pid is set.
pub trait Connector: Send + Sync + 'static {
    fn attach(&self, pid: u32) -> impl Future<Output = Result<FramedSession>> + Send;

    fn launch(&self, request: &LaunchRequest) -> impl Future<Output = Result<FramedSession>> + Send;

    fn launch_via_open(
        &self,
        request: &OpenAndAttachRequest,
    ) -> impl Future<Output = Result<FramedSession>> + Send;
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<u32, SessionHandle>,
    aliases: HashMap<String, u32>,
    // One guard per pid with a creation in flight. The state lock is never
    // held while a debugger is being started.
    creating: HashMap<u32, Arc<Mutex<()>>>,
}

impl RegistryState {
    fn take_session(&mut self, pid: u32) -> Option<SessionHandle> {
        self.aliases.retain(|_, target| *target != pid);
        self.sessions.remove(&pid)
    }

    fn aliases_for(&self, pid: u32) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .aliases
            .iter()
            .filter(|(_, target)| **target == pid)
            .map(|(alias, _)| alias.clone())
            .collect();
        aliases.sort();
        aliases
    }

    fn creation_guard(&mut self, pid: u32) -> Arc<Mutex<()>> {
        self.creating.entry(pid).or_default().clone()
    }

    /// Forgets the guard once no other caller is waiting on it.
    fn release_creation_guard(&mut self, pid: u32, guard: &Arc<Mutex<()>>) {
        if Arc::strong_count(guard) <= 2 {
            self.creating.remove(&pid);
        }
    }
}

pub struct SessionRegistry<C> {
    connector: C,
    state: Mutex<RegistryState>,
}

impl<C: Connector> SessionRegistry<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns the live session for `pid`, attaching a new one when there is
    /// none or the stored one is dead. Concurrent callers for the same pid
    /// share a single attach; other pids are never blocked by it.
    pub async fn get_or_create(&self, pid: u32) -> Result<SessionHandle> {
        if let Some(session) = self.get(pid).await {
            return Ok(session);
        }

        let guard = self.state.lock().await.creation_guard(pid);
        let created = {
            let _creating = guard.lock().await;
            // Whoever held the guard before us may have stored a session already.
            match self.get(pid).await {
                Some(session) => Ok(session),
                None => self.attach_and_store(pid).await,
            }
        };

        self.state
            .lock()
            .await
            .release_creation_guard(pid, &guard);
        created
    }

    async fn attach_and_store(&self, pid: u32) -> Result<SessionHandle> {
        tracing::info!(pid, "Starting debugger session");
        let session = Arc::new(self.connector.attach(pid).await?);

        let previous = self.state.lock().await.sessions.insert(pid, session.clone());
        if let Some(previous) = previous {
            tracing::info!(pid, "Replacing session stored during attach");
            previous.terminate().await;
        }
        Ok(session)
    }

    /// Returns the session for `pid` only if it is alive.
    pub async fn get(&self, pid: u32) -> Option<SessionHandle> {
        let mut state = self.state.lock().await;
        let session = state.sessions.get(&pid).cloned()?;
        if session.is_alive().await {
            return Some(session);
        }
        tracing::debug!(pid, "Evicting dead debugger session");
        state.sessions.remove(&pid);
        drop(state);
        session.terminate().await;
        None
    }

    /// Resolves a bundle id alias to a live session. A stale alias is removed.
    pub async fn get_by_bundle(&self, bundle_id: &str) -> Option<SessionHandle> {
        let mut state = self.state.lock().await;
        let pid = *state.aliases.get(bundle_id)?;

        let session = state.sessions.get(&pid).cloned();
        if let Some(session) = &session {
            if session.is_alive().await {
                return Some(session.clone());
            }
        }

        tracing::debug!(pid, "Dropping stale alias '{bundle_id}'");
        state.aliases.remove(bundle_id);
        if session.is_some() {
            state.sessions.remove(&pid);
        }
        drop(state);
        if let Some(session) = session {
            session.terminate().await;
        }
        None
    }

    pub async fn register_alias(&self, bundle_id: impl Into<String>, pid: u32) {
        let bundle_id = bundle_id.into();
        tracing::debug!(pid, "Registering alias '{bundle_id}'");
        self.state.lock().await.aliases.insert(bundle_id, pid);
    }

    /// Raw alias lookup; the pid may belong to a session that has since died.
    pub async fn get_pid(&self, bundle_id: &str) -> Option<u32> {
        self.state.lock().await.aliases.get(bundle_id).copied()
    }

    /// Terminates the session for `pid` and drops every alias pointing at it.
    /// Returns whether a session was stored.
    pub async fn remove(&self, pid: u32) -> bool {
        let session = self.state.lock().await.take_session(pid);
        match session {
            Some(session) => {
                session.terminate().await;
                true
            }
            None => false,
        }
    }

    pub async fn remove_bundle(&self, bundle_id: &str) -> bool {
        let session = {
            let mut state = self.state.lock().await;
            let Some(pid) = state.aliases.get(bundle_id).copied() else {
                return false;
            };
            state.take_session(pid)
        };
        if let Some(session) = session {
            session.terminate().await;
        }
        true
    }

    /// Launches an executable under a new session stored under its pid.
    pub async fn launch(&self, request: &LaunchRequest) -> Result<(SessionHandle, u32)> {
        let session = self.connector.launch(request).await?;
        self.store(session, None).await
    }

    /// Starts a bundle through the OS launch service and attaches to it,
    /// registering the bundle id alias when the request names one.
    pub async fn launch_via_open(
        &self,
        request: &OpenAndAttachRequest,
    ) -> Result<(SessionHandle, u32)> {
        let session = self.connector.launch_via_open(request).await?;
        self.store(session, request.bundle_id.as_deref()).await
    }

    async fn store(
        &self,
        session: FramedSession,
        bundle_id: Option<&str>,
    ) -> Result<(SessionHandle, u32)> {
        let Some(pid) = session.target_pid() else {
            session.terminate().await;
            return Err(LldbError::UnexpectedOutput(
                "session became ready without a target pid".to_string(),
            ));
        };

        let session = Arc::new(session);
        let previous = {
            let mut state = self.state.lock().await;
            if let Some(bundle_id) = bundle_id {
                state.aliases.insert(bundle_id.to_string(), pid);
            }
            state.sessions.insert(pid, session.clone())
        };
        if let Some(previous) = previous {
            tracing::info!(pid, "Replacing existing session for relaunched pid");
            previous.terminate().await;
        }
        Ok((session, pid))
    }

    /// Detaches the debugger from `pid`, leaving the target running, and
    /// drops the session.
    pub async fn detach(&self, pid: u32) -> Result<()> {
        let session = self
            .state
            .lock()
            .await
            .take_session(pid)
            .ok_or_else(|| LldbError::no_session_for_pid(pid))?;

        if session.is_alive().await {
            if let Err(e) = session.send_command(DETACH_COMMAND).await {
                tracing::warn!(pid, "Detach command failed: {e}");
            }
        }
        session.terminate().await;
        Ok(())
    }

    /// Summaries of live sessions, sorted by pid. Dead ones are evicted.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut state = self.state.lock().await;

        let mut dead = Vec::new();
        let mut pids: Vec<u32> = state.sessions.keys().copied().collect();
        pids.sort_unstable();

        let mut summaries = Vec::with_capacity(pids.len());
        for pid in pids {
            let Some(session) = state.sessions.get(&pid).cloned() else {
                continue;
            };
            if !session.is_alive().await {
                state.sessions.remove(&pid);
                dead.push(session);
                continue;
            }
            summaries.push(SessionSummary {
                pid,
                command_timeout_ms: u64::try_from(session.command_timeout().as_millis())
                    .unwrap_or(u64::MAX),
                bundle_ids: state.aliases_for(pid),
                transcript_path: session
                    .transcript_path()
                    .map(|path| path.display().to_string()),
            });
        }
        drop(state);

        for session in dead {
            session.terminate().await;
        }
        summaries
    }
}
