mod attempts;
mod consent;
mod dead_letter;
mod outbox;
mod queue;
mod requests;
mod suppression;
mod webhook_events;

pub use attempts::apply_provider_event;
pub use attempts::find_attempt_by_provider_message;
pub use attempts::insert_sending_attempt;
pub use attempts::insert_terminal_attempt;
pub use attempts::latest_attempt;
pub use attempts::mark_attempt_timed_out;
pub use attempts::record_attempt_outcome;
pub use attempts::TransitionOutcome;
pub use consent::grant_consent;
pub use consent::has_effective_consent;
pub use dead_letter::insert_dead_letter;
pub use dead_letter::list_dead_letters;
pub use dead_letter::DeadLetter;
pub use outbox::fetch_unpublished;
pub use outbox::insert_outbox_entry;
pub use outbox::mark_published;
pub use outbox::OutboxEntry;
pub use queue::claim_due_job;
pub use queue::delete_job;
pub use queue::enqueue_job;
pub use queue::reschedule_job;
pub use queue::JobRow;
pub use requests::get_request;
pub use requests::insert_request;
pub use suppression::insert_suppression;
pub use suppression::is_suppressed;
pub use webhook_events::insert_webhook_event;
use sqlx::Postgres;
use sqlx::Transaction;

pub type PgTransaction = Transaction<'static, Postgres>;
