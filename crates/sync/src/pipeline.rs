//! Per-send state machine over a single thread.
//!
//! Every step is a plain function on [`Thread`] so the session engine can apply it under its
//! lock and the transitions can be tested without IO.

use snafu::ensure;
use threadline_llm::{GenerationEvent, ProviderMessage, ResponsePacket, Role};
use threadline_storage::{MessageId, MessageRole};

use super::config::SyncSettings;
use super::error::{SyncResult, ValidationSnafu};
use super::model::{
    Attachment, Content, Delivery, GenerationMetrics, Message, Thread, TransientState,
};

pub const SUPERSEDED_NOTICE: &str = "This response was interrupted by a newer message.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Composing,
    OptimisticallyShown,
    PersistingUser,
    Generating,
    Streaming,
    Finalizing,
    Persisted,
    Failed,
}

impl PipelineState {
    pub fn can_advance_to(self, next: Self) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Composing, OptimisticallyShown)
                | (OptimisticallyShown, PersistingUser)
                | (PersistingUser, Generating)
                | (Generating, Streaming)
                | (Generating, Finalizing)
                | (Streaming, Streaming)
                | (Streaming, Finalizing)
                | (Finalizing, Persisted)
                | (PersistingUser | Generating | Streaming | Finalizing, Failed)
        )
    }
}

/// What the composer submits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Draft {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Rejects drafts before they touch any thread.
pub fn validate_draft(draft: &Draft, settings: &SyncSettings) -> SyncResult<()> {
    ensure!(
        !draft.text.trim().is_empty() || !draft.attachments.is_empty(),
        ValidationSnafu {
            stage: "validate-draft-empty",
            reason: "message is empty".to_string(),
        }
    );
    ensure!(
        draft.text.len() <= settings.max_message_bytes,
        ValidationSnafu {
            stage: "validate-draft-size",
            reason: format!(
                "message is {} bytes, the limit is {}",
                draft.text.len(),
                settings.max_message_bytes
            ),
        }
    );
    ensure!(
        draft.attachments.len() <= settings.max_attachments,
        ValidationSnafu {
            stage: "validate-draft-attachments",
            reason: format!(
                "{} attachments exceed the limit of {}",
                draft.attachments.len(),
                settings.max_attachments
            ),
        }
    );
    Ok(())
}

/// Bookkeeping needed to undo an optimistic insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticSend {
    pub user_message_id: MessageId,
    pub placeholder_id: MessageId,
    pub submitted_at_ms: u64,
    /// Title before auto-titling, when this send renamed the thread.
    pub previous_title: Option<String>,
}

/// Inserts the user message and a typing placeholder, bumps `updated_at_ms` and
/// auto-titles a thread that still has the default title.
pub fn show_optimistic(
    thread: &mut Thread,
    draft: &Draft,
    now_ms: u64,
    title_max_chars: usize,
) -> OptimisticSend {
    let user = Message::user(draft.text.clone(), draft.attachments.clone(), now_ms);
    let placeholder_id = MessageId::new_v7();
    let placeholder = Message::placeholder(placeholder_id.clone(), now_ms);
    let user_message_id = user.id.clone();

    let previous_title = match derive_title(&draft.text, title_max_chars) {
        Some(title) if thread.has_default_title() => {
            Some(std::mem::replace(&mut thread.title, title))
        }
        _ => None,
    };

    thread.messages.push(user);
    thread.messages.push(placeholder);
    thread.touch(now_ms);

    OptimisticSend {
        user_message_id,
        placeholder_id,
        submitted_at_ms: now_ms,
        previous_title,
    }
}

/// Removes both optimistic messages and restores the title.
pub fn rollback_optimistic(thread: &mut Thread, send: &OptimisticSend) {
    thread.messages.retain(|message| {
        message.id != send.user_message_id && message.id != send.placeholder_id
    });
    if let Some(previous) = &send.previous_title {
        thread.title = previous.clone();
    }
}

/// First line of the text, whitespace-collapsed and cut to `max_chars` characters.
pub fn derive_title(text: &str, max_chars: usize) -> Option<String> {
    let line = text.lines().find(|line| !line.trim().is_empty())?;
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    if max_chars == 0 || collapsed.is_empty() {
        return None;
    }

    if collapsed.chars().count() <= max_chars {
        return Some(collapsed);
    }
    let mut title = collapsed
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>()
        .trim_end()
        .to_string();
    title.push('…');
    Some(title)
}

/// Running state of one streamed generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamAccumulator {
    pub answer: String,
    pub reasoning: String,
}

impl StreamAccumulator {
    pub fn reasoning_trace(&self) -> Option<String> {
        let trace = self.reasoning.trim();
        (!trace.is_empty()).then(|| trace.to_string())
    }

    pub fn final_packets(&self) -> Vec<ResponsePacket> {
        vec![ResponsePacket::answer(self.answer.clone())]
    }
}

/// Applies a non-terminal event to the placeholder in place.
///
/// Answer deltas replace the placeholder body with the accumulated text, status updates
/// overwrite the single status line, reasoning fragments are only accumulated. Returns
/// false when the placeholder is gone or already settled.
pub fn apply_progress(
    thread: &mut Thread,
    placeholder_id: &MessageId,
    event: &GenerationEvent,
    accumulator: &mut StreamAccumulator,
) -> bool {
    let Some(placeholder) = thread.message_mut(placeholder_id) else {
        return false;
    };
    if !placeholder.is_typing() {
        return false;
    }

    match event {
        GenerationEvent::Partial(delta) => {
            accumulator.answer.push_str(delta);
            placeholder.content = Content::Packets(vec![ResponsePacket::answer(
                accumulator.answer.clone(),
            )]);
        }
        GenerationEvent::Status(status) => {
            placeholder.transient_state = Some(TransientState::Typing {
                status: Some(status.clone()),
            });
        }
        GenerationEvent::Reasoning(fragment) => accumulator.reasoning.push_str(fragment),
        GenerationEvent::Final(_) | GenerationEvent::Done | GenerationEvent::Error(_) => {}
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Replaced,
    /// The placeholder had vanished; the final message was appended once.
    Appended,
}

/// Settles the placeholder with final packets. Finalizing the same id again replaces the
/// same message, so a thread never ends up with two copies.
pub fn finalize(
    thread: &mut Thread,
    placeholder_id: &MessageId,
    packets: Vec<ResponsePacket>,
    metrics: GenerationMetrics,
    now_ms: u64,
) -> FinalizeOutcome {
    let outcome = match thread.message_mut(placeholder_id) {
        Some(message) => {
            message.role = MessageRole::Assistant;
            message.content = Content::Packets(packets);
            message.transient_state = None;
            message.generation_metrics = Some(metrics);
            message.delivery = Delivery::Pending;
            FinalizeOutcome::Replaced
        }
        None => {
            let mut message = Message::placeholder(placeholder_id.clone(), now_ms);
            message.content = Content::Packets(packets);
            message.transient_state = None;
            message.generation_metrics = Some(metrics);
            thread.messages.push(message);
            FinalizeOutcome::Appended
        }
    };
    thread.touch(now_ms);
    outcome
}

/// Replaces the placeholder with a single synthetic notice under the same id.
pub fn fail(thread: &mut Thread, placeholder_id: &MessageId, packet: ResponsePacket, now_ms: u64) {
    match thread.message_mut(placeholder_id) {
        Some(message) => {
            message.role = MessageRole::Assistant;
            message.content = Content::Packets(vec![packet]);
            message.transient_state = None;
            message.generation_metrics = None;
            message.delivery = Delivery::Synthetic;
        }
        None => thread
            .messages
            .push(Message::synthetic(placeholder_id.clone(), packet, now_ms)),
    }
    thread.touch(now_ms);
}

pub fn mark_delivery(thread: &mut Thread, message_id: &MessageId, delivery: Delivery) {
    if let Some(message) = thread.message_mut(message_id) {
        message.delivery = delivery;
    }
}

/// Recent conversation turns for the generation service, oldest first.
///
/// Typing placeholders and synthetic notices are left out.
pub fn history(thread: &Thread, window: usize) -> Vec<ProviderMessage> {
    let turns = thread
        .messages
        .iter()
        .filter(|message| !message.is_typing() && message.delivery != Delivery::Synthetic)
        .filter_map(|message| {
            let text = message.text();
            if text.trim().is_empty() {
                return None;
            }
            let role = match message.role {
                MessageRole::System => Role::System,
                MessageRole::User => Role::User,
                MessageRole::Assistant => Role::Assistant,
            };
            Some(ProviderMessage::new(role, text))
        })
        .collect::<Vec<_>>();

    let skip = turns.len().saturating_sub(window.max(1));
    turns.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use threadline_storage::{DEFAULT_THREAD_TITLE, ThreadId};

    use super::*;
    use crate::runtime::IdentityKey;

    fn thread() -> Thread {
        Thread::local(ThreadId::new_v7(), Some(IdentityKey::default_key()), 1)
    }

    fn metrics() -> GenerationMetrics {
        GenerationMetrics {
            elapsed_ms: 12,
            reasoning_trace: None,
        }
    }

    #[test]
    fn pipeline_transitions_follow_the_happy_path() {
        use PipelineState::*;
        let path = [
            Composing,
            OptimisticallyShown,
            PersistingUser,
            Generating,
            Streaming,
            Finalizing,
            Persisted,
        ];
        for step in path.windows(2) {
            assert!(step[0].can_advance_to(step[1]), "{:?} -> {:?}", step[0], step[1]);
        }
        assert!(Streaming.can_advance_to(Failed));
        assert!(!Composing.can_advance_to(Failed));
        assert!(!Persisted.can_advance_to(Streaming));
    }

    #[test]
    fn drafts_are_validated_before_the_pipeline() {
        let settings = SyncSettings::default();
        assert!(validate_draft(&Draft::text("   "), &settings).is_err());
        assert!(validate_draft(&Draft::text("x".repeat(settings.max_message_bytes + 1)), &settings).is_err());
        assert!(validate_draft(&Draft::text("hello"), &settings).is_ok());

        let mut crowded = Draft::text("files");
        for index in 0..=settings.max_attachments {
            crowded = crowded.with_attachment(Attachment::new(format!("{index}.txt"), 1, "text"));
        }
        assert!(validate_draft(&crowded, &settings).is_err());
    }

    #[test]
    fn optimistic_insert_adds_user_and_typing_placeholder_then_rolls_back() {
        let mut thread = thread();
        let send = show_optimistic(&mut thread, &Draft::text("hello"), 10, 48);

        assert_eq!(thread.messages.len(), 2);
        assert_eq!(thread.title, "hello");
        assert_eq!(thread.updated_at_ms, 10);
        assert!(thread.message(&send.placeholder_id).is_some_and(Message::is_typing));

        rollback_optimistic(&mut thread, &send);
        assert!(thread.messages.is_empty());
        assert_eq!(thread.title, DEFAULT_THREAD_TITLE);
    }

    #[test]
    fn auto_title_happens_once() {
        let mut thread = thread();
        show_optimistic(&mut thread, &Draft::text("first question"), 10, 48);
        let second = show_optimistic(&mut thread, &Draft::text("second question"), 11, 48);

        assert_eq!(thread.title, "first question");
        assert_eq!(second.previous_title, None);
    }

    #[test]
    fn titles_are_truncated_by_characters() {
        assert_eq!(derive_title("  héllo   wörld  ", 48).as_deref(), Some("héllo wörld"));
        assert_eq!(derive_title("abcdefghij", 5).as_deref(), Some("abcd…"));
        assert_eq!(derive_title("\n\n  \n", 5), None);
    }

    #[test]
    fn partial_updates_replace_in_place_and_status_rolls() {
        let mut thread = thread();
        let send = show_optimistic(&mut thread, &Draft::text("hi"), 10, 48);
        let mut accumulator = StreamAccumulator::default();

        for event in [
            GenerationEvent::Status("thinking".to_string()),
            GenerationEvent::Partial("Hel".to_string()),
            GenerationEvent::Status("writing".to_string()),
            GenerationEvent::Partial("lo".to_string()),
        ] {
            assert!(apply_progress(&mut thread, &send.placeholder_id, &event, &mut accumulator));
        }

        assert_eq!(thread.messages.len(), 2);
        let placeholder = thread.message(&send.placeholder_id).expect("placeholder");
        assert_eq!(placeholder.text(), "Hello");
        assert_eq!(placeholder.status_line(), Some("writing"));
    }

    #[test]
    fn finalize_twice_leaves_one_assistant_message() {
        let mut thread = thread();
        let send = show_optimistic(&mut thread, &Draft::text("hi"), 10, 48);

        let first = finalize(&mut thread, &send.placeholder_id, vec![ResponsePacket::answer("one")], metrics(), 20);
        let second = finalize(&mut thread, &send.placeholder_id, vec![ResponsePacket::answer("two")], metrics(), 21);

        assert_eq!(first, FinalizeOutcome::Replaced);
        assert_eq!(second, FinalizeOutcome::Replaced);
        let assistants = thread
            .messages
            .iter()
            .filter(|message| message.role == MessageRole::Assistant)
            .collect::<Vec<_>>();
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].text(), "two");
        assert!(!assistants[0].is_typing());
    }

    #[test]
    fn settled_placeholders_ignore_late_progress() {
        let mut thread = thread();
        let send = show_optimistic(&mut thread, &Draft::text("hi"), 10, 48);
        finalize(&mut thread, &send.placeholder_id, vec![ResponsePacket::answer("done")], metrics(), 20);

        let mut accumulator = StreamAccumulator::default();
        let applied = apply_progress(
            &mut thread,
            &send.placeholder_id,
            &GenerationEvent::Partial("late".to_string()),
            &mut accumulator,
        );
        assert!(!applied);
        assert_eq!(thread.message(&send.placeholder_id).map(Message::text).as_deref(), Some("done"));
    }

    #[test]
    fn failure_leaves_one_synthetic_message_under_the_placeholder_id() {
        let mut thread = thread();
        let send = show_optimistic(&mut thread, &Draft::text("hi"), 10, 48);
        fail(&mut thread, &send.placeholder_id, ResponsePacket::error("boom"), 15);

        assert_eq!(thread.messages.len(), 2);
        let notice = thread.message(&send.placeholder_id).expect("notice");
        assert_eq!(notice.delivery, Delivery::Synthetic);
        assert!(!notice.is_typing());
    }

    #[test]
    fn history_skips_placeholders_and_respects_window() {
        let mut thread = thread();
        for index in 0..3 {
            let send = show_optimistic(&mut thread, &Draft::text(format!("q{index}")), index, 48);
            finalize(
                &mut thread,
                &send.placeholder_id,
                vec![ResponsePacket::answer(format!("a{index}"))],
                metrics(),
                index,
            );
        }
        show_optimistic(&mut thread, &Draft::text("latest"), 9, 48);

        let turns = history(&thread, 3);
        let texts = turns.iter().map(|turn| turn.content.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["q2", "a2", "latest"]);
        assert_eq!(turns[2].role, Role::User);
    }
}
