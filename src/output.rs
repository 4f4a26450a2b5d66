use colored::*;
use events::{EventEnvelope, EventType, Topic};
use sse::ConnectionState;
use std::sync::Arc;

pub fn print_event(envelope: &EventEnvelope) {
    println!(
        "\n[{}] {} event received",
        envelope.received_at.format("%H:%M:%S").to_string().bold(),
        envelope.event_type.to_string().yellow()
    );

    if let Ok(pretty) = serde_json::to_string_pretty(&envelope.payload) {
        println!("   {}", pretty.dimmed());
    }
}

pub fn print_state(topic: Topic, state: ConnectionState) {
    let label = state.to_string();
    let state = match state {
        ConnectionState::Connected => label.green().bold(),
        ConnectionState::Connecting | ConnectionState::Reconnecting => label.yellow(),
        ConnectionState::Failed => label.red().bold(),
        ConnectionState::Disconnected => label.dimmed(),
    };

    println!("{} {} stream {}", "→".blue(), topic.to_string().bright_white(), state);
}

pub fn print_summary(history: &[Arc<EventEnvelope>], unread: u64, printed: usize) {
    println!("\n{}", "=== STREAM SUMMARY ===".bright_white().bold());

    for (event_type, count) in count_by_type(history) {
        println!("{:>24}: {}", event_type.to_string(), count.to_string().green());
    }

    println!(
        "\n{}: {} printed, {} kept in history, {} unread notifications",
        "Events".bold(),
        printed,
        history.len(),
        unread.to_string().yellow()
    );
}

/// Number of recorded events per type, in vocabulary order, omitting types
/// that never arrived.
fn count_by_type(history: &[Arc<EventEnvelope>]) -> Vec<(EventType, usize)> {
    EventType::ALL
        .iter()
        .map(|&event_type| {
            let count = history
                .iter()
                .filter(|envelope| envelope.event_type == event_type)
                .count();
            (event_type, count)
        })
        .filter(|(_, count)| *count > 0)
        .collect()
}
