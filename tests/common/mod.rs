#![allow(dead_code)]

use async_trait::async_trait;
use ratewarden::{AuthorityError, RateLimitAuthority, ServerVerdict, SubscriptionSource};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the scripted authority answers.
#[derive(Debug, Clone)]
pub enum Reply {
    Verdict(ServerVerdict),
    Fail(AuthorityError),
    /// Never answers; only a deadline ends the call.
    Hang,
}

/// Authority that answers from a script, then repeats a fallback reply.
#[derive(Debug, Clone)]
pub struct ScriptedAuthority {
    script: Arc<Mutex<VecDeque<Reply>>>,
    fallback: Reply,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    endpoints: Arc<Mutex<Vec<String>>>,
}

impl ScriptedAuthority {
    fn with_fallback(fallback: Reply) -> Self {
        Self {
            script: Arc::default(),
            fallback,
            delay: Duration::ZERO,
            calls: Arc::default(),
            endpoints: Arc::default(),
        }
    }

    pub fn allowing() -> Self {
        Self::with_fallback(Reply::Verdict(ServerVerdict::allow()))
    }

    pub fn denying(retry_after_secs: u64) -> Self {
        Self::with_fallback(Reply::Verdict(ServerVerdict::deny(retry_after_secs)))
    }

    pub fn failing() -> Self {
        Self::with_fallback(Reply::Fail(AuthorityError::Transport("connection refused".into())))
    }

    pub fn hanging() -> Self {
        Self::with_fallback(Reply::Hang)
    }

    /// Answer `reply` before falling back.
    pub fn then(self, reply: Reply) -> Self {
        self.script.lock().unwrap().push_back(reply);
        self
    }

    /// Wait `delay` before every answer.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl RateLimitAuthority for ScriptedAuthority {
    async fn confirm(&self, endpoint: &str) -> Result<ServerVerdict, AuthorityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(endpoint.to_string());
        let reply = self.script.lock().unwrap().pop_front().unwrap_or_else(|| self.fallback.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match reply {
            Reply::Verdict(verdict) => Ok(verdict),
            Reply::Fail(err) => Err(err),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Subscription lookup returning a settable payload.
#[derive(Debug, Clone)]
pub struct ScriptedPlan {
    reply: Arc<Mutex<Result<Value, AuthorityError>>>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedPlan {
    pub fn returning(payload: Value) -> Self {
        Self {
            reply: Arc::new(Mutex::new(Ok(payload))),
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        let plan = Self::returning(Value::Null);
        plan.fail(AuthorityError::Status(500));
        plan
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set(&self, payload: Value) {
        *self.reply.lock().unwrap() = Ok(payload);
    }

    pub fn fail(&self, err: AuthorityError) {
        *self.reply.lock().unwrap() = Err(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionSource for ScriptedPlan {
    async fn fetch_status(&self) -> Result<Value, AuthorityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.lock().unwrap().clone()
    }
}
