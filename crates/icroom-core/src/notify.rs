// Out-of-band alerts (failed invocations, completed sessions, evicted
// members). The default sink writes them to the tracing log.

use tracing::{info, warn};

use crate::model::Decision;

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    InvocationFailed {
        session_id: String,
        request_id: String,
        agent_type: String,
        ticker: String,
        reason: String,
    },
    SessionCompleted {
        session_id: String,
        ticker: String,
        decision: Decision,
    },
    MemberEvicted {
        session_id: String,
        user_name: String,
    },
}

/// Must not block: called from inside the per-session critical section.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: Alert) {
        match alert {
            Alert::InvocationFailed {
                session_id,
                request_id,
                agent_type,
                ticker,
                reason,
            } => warn!(
                %session_id, %request_id, %agent_type, %ticker,
                "agent invocation failed: {reason}"
            ),
            Alert::SessionCompleted {
                session_id,
                ticker,
                decision,
            } => info!(%session_id, %ticker, decision = decision.as_str(), "debate completed"),
            Alert::MemberEvicted {
                session_id,
                user_name,
            } => warn!(%session_id, %user_name, "member evicted (outbound queue unavailable)"),
        }
    }
}
