//! Auto-approval: answering agent prompts without a human
//!
//! When a prompt is detected the runner asks [`resolve`] for a reply. With
//! auto-approval enabled, the adapter's [`AutoPolicy`] handlers are tried in
//! order and the first one with an answer wins. Otherwise the prompt is
//! deferred to the human through an `interactionNeeded` event.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::adapter::InteractionPayload;
use crate::Result;

/// Confirmation phrases that mark a prompt even without adapter patterns
const HEURISTIC_PHRASES: &[&str] = &[
    "apply this change?",
    "do you want to proceed",
    "allow once",
    "confirm",
    "[y/n]",
    "(y/n)",
];

/// What a handler sees when asked to answer a prompt
#[derive(Debug, Clone, Copy)]
pub struct ApprovalRequest<'a> {
    pub task_id: &'a str,
    pub adapter: &'a str,
    pub payload: &'a InteractionPayload,
}

impl ApprovalRequest<'_> {
    /// Prompt text, lowercased for matching
    fn prompt_lower(&self) -> String {
        self.payload
            .prompt
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
    }
}

/// Maps an observed prompt to a reply, or `None` for "no opinion"
pub trait ApprovalHandler: Send + Sync {
    fn name(&self) -> &str {
        "custom"
    }

    fn respond(&self, request: &ApprovalRequest<'_>) -> Result<Option<String>>;
}

impl<F> ApprovalHandler for F
where
    F: Fn(&ApprovalRequest<'_>) -> Result<Option<String>> + Send + Sync,
{
    fn respond(&self, request: &ApprovalRequest<'_>) -> Result<Option<String>> {
        self(request)
    }
}

/// Answers `y` to yes/no confirmations
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmYes;

impl ApprovalHandler for ConfirmYes {
    fn name(&self) -> &str {
        "confirm_yes"
    }

    fn respond(&self, request: &ApprovalRequest<'_>) -> Result<Option<String>> {
        let prompt = request.prompt_lower();
        let yes_no = ["[y/n]", "(y/n)", "[yes/no]", "(yes/no)"]
            .iter()
            .any(|marker| prompt.contains(marker));
        Ok(yes_no.then(|| "y".to_string()))
    }
}

/// Picks the "allow once" entry of a numbered permission menu
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowOnce;

impl ApprovalHandler for AllowOnce {
    fn name(&self) -> &str {
        "allow_once"
    }

    fn respond(&self, request: &ApprovalRequest<'_>) -> Result<Option<String>> {
        let prompt = request.prompt_lower();
        let Some(line) = prompt.lines().find(|l| l.contains("allow once")) else {
            return Ok(None);
        };

        // "❯ 2. Allow once" answers "2"; an unnumbered entry is the first
        let number: String = line
            .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        Ok(Some(if number.is_empty() {
            "1".to_string()
        } else {
            number
        }))
    }
}

/// Per-adapter auto-approval behaviour
#[derive(Clone, Default)]
pub struct AutoPolicy {
    /// Arguments injected into interactive launches when auto-approval is on
    pub extra_args: Vec<String>,
    /// Handlers tried in order
    pub handlers: Vec<Arc<dyn ApprovalHandler>>,
}

impl AutoPolicy {
    /// Policy answering yes to every yes/no prompt
    pub fn confirm_yes() -> Self {
        Self::default().with_handler(ConfirmYes)
    }

    pub fn with_handler(mut self, handler: impl ApprovalHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl fmt::Debug for AutoPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("AutoPolicy")
            .field("extra_args", &self.extra_args)
            .field("handlers", &names)
            .finish()
    }
}

/// Outcome of resolving a detected prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Send `text` now; `handler` produced it
    Respond { text: String, handler: String },
    /// Ask the human
    Defer,
}

/// A handler that failed while resolving; reported, never fatal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    pub message: String,
}

/// Decide how to answer a prompt.
///
/// Handler errors and panics count as "no opinion" and are returned
/// alongside the resolution so the caller can report them.
pub fn resolve(
    auto_approve: bool,
    policy: Option<&AutoPolicy>,
    request: &ApprovalRequest<'_>,
) -> (Resolution, Vec<HandlerFailure>) {
    let mut failures = Vec::new();

    let policy = match policy {
        Some(policy) if auto_approve => policy,
        _ => return (Resolution::Defer, failures),
    };

    for handler in &policy.handlers {
        let answer = match panic::catch_unwind(AssertUnwindSafe(|| handler.respond(request))) {
            Ok(answer) => answer.map_err(|e| e.to_string()),
            Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
        };
        match answer {
            Ok(Some(text)) => {
                return (
                    Resolution::Respond {
                        text,
                        handler: handler.name().to_string(),
                    },
                    failures,
                )
            }
            Ok(None) => {}
            Err(message) => failures.push(HandlerFailure {
                handler: handler.name().to_string(),
                message,
            }),
        }
    }

    (Resolution::Defer, failures)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown cause"
    }
}

/// Return the first confirmation phrase found in `text`, if any
pub fn heuristic_prompt(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    HEURISTIC_PHRASES
        .iter()
        .copied()
        .find(|phrase| lower.contains(phrase))
}

/// Terminate `text` with a carriage return unless it already ends a line
pub fn normalize_input(text: &str) -> String {
    if text.ends_with('\r') || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\r", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn payload(prompt: &str) -> InteractionPayload {
        InteractionPayload {
            prompt: Some(prompt.to_string()),
            context: None,
        }
    }

    fn request<'a>(payload: &'a InteractionPayload) -> ApprovalRequest<'a> {
        ApprovalRequest {
            task_id: "t1",
            adapter: "claude",
            payload,
        }
    }

    #[test]
    fn test_confirm_yes() {
        let p = payload("Apply this change? [y/N]");
        assert_eq!(ConfirmYes.respond(&request(&p)).unwrap(), Some("y".to_string()));

        let p = payload("Thinking...");
        assert_eq!(ConfirmYes.respond(&request(&p)).unwrap(), None);
    }

    #[test]
    fn test_allow_once_picks_menu_number() {
        let p = payload("Run `ls`?\n  1. Yes, always\n❯ 2. Allow once\n  3. Deny");
        assert_eq!(AllowOnce.respond(&request(&p)).unwrap(), Some("2".to_string()));

        let p = payload("Allow once / Always / Deny");
        assert_eq!(AllowOnce.respond(&request(&p)).unwrap(), Some("1".to_string()));
    }

    #[test]
    fn test_resolve_disabled_defers() {
        let p = payload("[y/N]");
        let policy = AutoPolicy::confirm_yes();
        let (resolution, _) = resolve(false, Some(&policy), &request(&p));
        assert_eq!(resolution, Resolution::Defer);

        let (resolution, _) = resolve(true, None, &request(&p));
        assert_eq!(resolution, Resolution::Defer);
    }

    fn no_opinion(_: &ApprovalRequest<'_>) -> Result<Option<String>> {
        Ok(None)
    }

    fn never(_: &ApprovalRequest<'_>) -> Result<Option<String>> {
        Ok(Some("never".to_string()))
    }

    fn boom(_: &ApprovalRequest<'_>) -> Result<Option<String>> {
        Err(Error::Unsupported("boom".to_string()))
    }

    #[test]
    fn test_resolve_first_answer_wins() {
        let p = payload("Proceed? [y/N]");
        let policy = AutoPolicy::default()
            .with_handler(no_opinion)
            .with_handler(ConfirmYes)
            .with_handler(never);

        let (resolution, failures) = resolve(true, Some(&policy), &request(&p));
        assert_eq!(
            resolution,
            Resolution::Respond {
                text: "y".to_string(),
                handler: "confirm_yes".to_string()
            }
        );
        assert!(failures.is_empty());
    }

    #[test]
    fn test_failing_handler_is_no_opinion() {
        let p = payload("Proceed? [y/N]");
        let policy = AutoPolicy::default()
            .with_handler(boom)
            .with_handler(ConfirmYes);

        let (resolution, failures) = resolve(true, Some(&policy), &request(&p));
        assert!(matches!(resolution, Resolution::Respond { ref text, .. } if text == "y"));
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("boom"));
    }

    fn panics(_: &ApprovalRequest<'_>) -> Result<Option<String>> {
        panic!("handler bug")
    }

    #[test]
    fn test_panicking_handler_is_no_opinion() {
        let p = payload("Proceed? [y/N]");
        let policy = AutoPolicy::default()
            .with_handler(panics)
            .with_handler(ConfirmYes);

        let (resolution, failures) = resolve(true, Some(&policy), &request(&p));
        assert!(matches!(resolution, Resolution::Respond { ref text, .. } if text == "y"));
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("handler bug"));
    }

    #[test]
    fn test_heuristic_prompt() {
        assert_eq!(heuristic_prompt("Apply this change? "), Some("apply this change?"));
        assert_eq!(heuristic_prompt("Press ALLOW ONCE"), Some("allow once"));
        assert_eq!(heuristic_prompt("compiling crate"), None);
    }

    #[test]
    fn test_normalize_input() {
        assert_eq!(normalize_input("yes"), "yes\r");
        assert_eq!(normalize_input("yes\n"), "yes\n");
        assert_eq!(normalize_input("yes\r"), "yes\r");
    }
}
