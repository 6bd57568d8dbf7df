//! Tool permission arbitration
//!
//! Incoming `session/request_permission` calls are evaluated against an
//! ordered table of read-only rules. A request matching a rule is answered at
//! once with the agent's "allow" option. Everything else is deferred: the
//! request is parked in a review table, announced to the conversation as a
//! `permission_request` event, and answered by a reviewer through
//! [`PermissionArbitrator::resolve`] or rejected when the review window closes.

use crate::agent::client::SessionMap;
use crate::agent::hub::BroadcastHub;
use crate::agent::rpc::RpcChannel;
use crate::agent::types::*;
use crate::config::PermissionConfig;
use crate::error::{Error, Result};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

// =============================================================================
// Heuristic
// =============================================================================

/// Rule that approved a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalRule {
    Query,
    Url,
    FileRead,
    ReadOnlyOperation,
    SafeCommand,
}

impl ApprovalRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalRule::Query => "query",
            ApprovalRule::Url => "url",
            ApprovalRule::FileRead => "file_read",
            ApprovalRule::ReadOnlyOperation => "read_only_operation",
            ApprovalRule::SafeCommand => "safe_command",
        }
    }
}

/// Outcome of the heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve(ApprovalRule),
    Defer,
}

type RuleCheck = fn(&Map<String, Value>, &[String]) -> bool;

/// Priority-ordered rules; the first match wins.
const RULES: &[(ApprovalRule, RuleCheck)] = &[
    (ApprovalRule::Query, has_query),
    (ApprovalRule::Url, has_url),
    (ApprovalRule::FileRead, is_file_read),
    (ApprovalRule::ReadOnlyOperation, is_read_only_operation),
    (ApprovalRule::SafeCommand, is_safe_command),
];

const READ_ONLY_OPERATIONS: &[&str] = &["glob", "grep", "list"];

fn operation(input: &Map<String, Value>) -> Option<&str> {
    input.get("operation").and_then(Value::as_str)
}

fn has_query(input: &Map<String, Value>, _: &[String]) -> bool {
    input.contains_key("query")
}

fn has_url(input: &Map<String, Value>, _: &[String]) -> bool {
    input.contains_key("url")
}

fn is_file_read(input: &Map<String, Value>, _: &[String]) -> bool {
    let has_path = input.contains_key("file_path") || input.contains_key("filePath");
    has_path && matches!(operation(input), None | Some("read"))
}

fn is_read_only_operation(input: &Map<String, Value>, _: &[String]) -> bool {
    operation(input).is_some_and(|op| READ_ONLY_OPERATIONS.contains(&op))
}

fn is_safe_command(input: &Map<String, Value>, safe_commands: &[String]) -> bool {
    let command = match input.get("command") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => return false,
    };
    let command = command.trim();
    safe_commands.iter().any(|safe| {
        command == safe
            || command
                .strip_prefix(safe.as_str())
                .is_some_and(|rest| rest.starts_with(' '))
    })
}

/// Evaluate a tool's raw input
pub fn evaluate(input: &Map<String, Value>, safe_commands: &[String]) -> Verdict {
    RULES
        .iter()
        .find(|(_, check)| check(input, safe_commands))
        .map(|(rule, _)| Verdict::Approve(*rule))
        .unwrap_or(Verdict::Defer)
}

pub fn should_auto_approve(input: &Map<String, Value>, safe_commands: &[String]) -> bool {
    matches!(evaluate(input, safe_commands), Verdict::Approve(_))
}

fn find_option<'a>(
    options: &'a [PermissionOption],
    preference: &[&str],
) -> Option<&'a PermissionOption> {
    preference.iter().find_map(|wanted| {
        options
            .iter()
            .find(|o| o.option_id == *wanted || o.kind == *wanted)
    })
}

/// "allow", else "allow_once", else "allow_always"
pub fn find_allow_option(options: &[PermissionOption]) -> Option<&PermissionOption> {
    find_option(options, &["allow", "allow_once", "allow_always"])
}

/// Option used when a review times out
pub fn find_reject_option(options: &[PermissionOption]) -> Option<&PermissionOption> {
    find_option(options, &["reject_once", "reject_always", "reject"])
}

// =============================================================================
// Arbitrator
// =============================================================================

/// What happened to one permission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approved {
        option_id: String,
        rule: ApprovalRule,
    },
    Deferred {
        request_id: String,
    },
}

struct PendingReview {
    call_id: u64,
    conversation_id: String,
    options: Vec<PermissionOption>,
    expiry: AbortHandle,
}

/// Answers the agent's permission requests for one protocol channel
pub struct PermissionArbitrator {
    channel: Arc<RpcChannel>,
    sessions: SessionMap,
    hub: Arc<BroadcastHub>,
    policy: PermissionConfig,
    review_timeout: Duration,
    pending: Mutex<HashMap<String, PendingReview>>,
}

impl PermissionArbitrator {
    pub fn new(
        channel: Arc<RpcChannel>,
        sessions: SessionMap,
        hub: Arc<BroadcastHub>,
        policy: PermissionConfig,
    ) -> Self {
        let review_timeout = policy.review_timeout();
        Self {
            channel,
            sessions,
            hub,
            policy,
            review_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Override the review window
    pub fn with_review_timeout(mut self, timeout: Duration) -> Self {
        self.review_timeout = timeout;
        self
    }

    /// Serve incoming calls until the channel closes
    pub async fn run<S>(self: Arc<Self>, mut calls: S)
    where
        S: Stream<Item = IncomingCall> + Unpin,
    {
        while let Some(call) = calls.next().await {
            if call.method != methods::REQUEST_PERMISSION {
                tracing::warn!(id = call.id, method = %call.method, "Unsupported agent call");
                let message = format!("Method not found: {}", call.method);
                if let Err(e) = self
                    .channel
                    .respond_error(call.id, METHOD_NOT_FOUND, &message)
                    .await
                {
                    tracing::warn!("Failed to answer unsupported call: {}", e);
                }
                continue;
            }

            match self.handle(call).await {
                Ok(decision) => tracing::debug!(?decision, "Permission request handled"),
                Err(e) => tracing::warn!("Permission request left unanswered: {}", e),
            }
        }

        self.cancel_all("agent_terminated").await;
    }

    /// Decide on one permission request.
    ///
    /// Approvals are answered immediately. Deferred requests are answered
    /// later by a reviewer or the review timeout, never from here. A call that
    /// is not a permission request, or whose payload cannot be decoded, is left
    /// unanswered.
    pub async fn handle(self: &Arc<Self>, call: IncomingCall) -> Result<Decision> {
        if call.method != methods::REQUEST_PERMISSION {
            return Err(Error::PermissionParse(format!(
                "unexpected method '{}'",
                call.method
            )));
        }
        let request: PermissionRequest = serde_json::from_value(call.params)
            .map_err(|e| Error::PermissionParse(e.to_string()))?;

        let verdict = if self.policy.auto_approve {
            evaluate(&request.tool_call.raw_input, &self.policy.safe_commands)
        } else {
            Verdict::Defer
        };

        if let Verdict::Approve(rule) = verdict {
            if let Some(option) = find_allow_option(&request.options) {
                tracing::info!(
                    session_id = %request.session_id,
                    tool_call_id = %request.tool_call.tool_call_id,
                    rule = rule.as_str(),
                    option_id = %option.option_id,
                    "Auto-approving tool call"
                );
                self.channel
                    .respond(call.id, permission_selected(&option.option_id))
                    .await?;
                return Ok(Decision::Approved {
                    option_id: option.option_id.clone(),
                    rule,
                });
            }
            tracing::debug!(
                tool_call_id = %request.tool_call.tool_call_id,
                "No allow option offered, deferring"
            );
        }

        Ok(self.defer(call.id, request).await)
    }

    async fn defer(self: &Arc<Self>, call_id: u64, request: PermissionRequest) -> Decision {
        let request_id = uuid::Uuid::new_v4().to_string();
        let conversation_id = match self.sessions.conversation_for(&request.session_id).await {
            Some(id) => id,
            None => {
                tracing::warn!(session_id = %request.session_id, "Permission request for unbound session");
                request.session_id.clone()
            }
        };

        {
            // Registered under the lock so the expiry task always finds it.
            let mut pending = self.pending.lock().await;
            let expiry = {
                let arbitrator = Arc::clone(self);
                let request_id = request_id.clone();
                let after = self.review_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    arbitrator.expire(&request_id).await;
                })
                .abort_handle()
            };
            pending.insert(
                request_id.clone(),
                PendingReview {
                    call_id,
                    conversation_id: conversation_id.clone(),
                    options: request.options.clone(),
                    expiry,
                },
            );
        }

        tracing::info!(
            request_id = %request_id,
            conversation_id = %conversation_id,
            tool_call_id = %request.tool_call.tool_call_id,
            "Tool call awaiting review"
        );

        self.hub.publish(&DomainEvent::PermissionRequested {
            conversation_id,
            request_id: request_id.clone(),
            tool_call_id: request.tool_call.tool_call_id,
            title: request.tool_call.title,
            raw_input: request.tool_call.raw_input,
            options: request.options,
            requested_at: chrono::Utc::now(),
        });

        Decision::Deferred { request_id }
    }

    /// Answer a deferred request. `None` cancels it.
    pub async fn resolve(&self, request_id: &str, option_id: Option<&str>) -> Result<()> {
        let review = {
            let mut pending = self.pending.lock().await;
            let review = pending.get(request_id).ok_or_else(|| {
                Error::Session(format!("unknown permission request: {}", request_id))
            })?;
            if let Some(option_id) = option_id {
                if !review.options.iter().any(|o| o.option_id == option_id) {
                    return Err(Error::Session(format!(
                        "option '{}' was not offered for request {}",
                        option_id, request_id
                    )));
                }
            }
            pending
                .remove(request_id)
                .ok_or_else(|| Error::Session(format!("unknown permission request: {}", request_id)))?
        };
        review.expiry.abort();

        let reply = match option_id {
            Some(option_id) => permission_selected(option_id),
            None => {
                self.hub.publish(&DomainEvent::PermissionCancelled {
                    conversation_id: review.conversation_id.clone(),
                    request_id: request_id.to_string(),
                    reason: "declined".to_string(),
                });
                permission_cancelled()
            }
        };

        tracing::info!(request_id, option_id = ?option_id, "Permission request resolved by reviewer");
        self.channel.respond(review.call_id, reply).await
    }

    /// Requests currently awaiting review
    pub async fn pending_reviews(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn expire(&self, request_id: &str) {
        let Some(review) = self.pending.lock().await.remove(request_id) else {
            return;
        };

        let reply = match find_reject_option(&review.options) {
            Some(option) => permission_selected(&option.option_id),
            None => permission_cancelled(),
        };
        tracing::warn!(request_id, "Permission review timed out, rejecting");
        if let Err(e) = self.channel.respond(review.call_id, reply).await {
            tracing::warn!(request_id, "Failed to send timeout rejection: {}", e);
        }

        self.hub.publish(&DomainEvent::PermissionCancelled {
            conversation_id: review.conversation_id,
            request_id: request_id.to_string(),
            reason: "timeout".to_string(),
        });
    }

    /// Drop every pending review without answering the agent
    pub async fn cancel_all(&self, reason: &str) {
        let drained: Vec<(String, PendingReview)> = self.pending.lock().await.drain().collect();
        for (request_id, review) in drained {
            review.expiry.abort();
            self.hub.publish(&DomainEvent::PermissionCancelled {
                conversation_id: review.conversation_id,
                request_id,
                reason: reason.to_string(),
            });
        }
    }
}
