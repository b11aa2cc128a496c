use relay_core::conversation::TextOutcome;

use crate::router::AppState;

use super::Sender;

pub(crate) async fn handle_text(state: &AppState, sender: &Sender, text: &str) -> anyhow::Result<()> {
    let outcome = state
        .conversation
        .on_text(sender.user, &sender.display_name, text)
        .await?;
    if let TextOutcome::Replied { count, nudged } = outcome {
        tracing::debug!(user = %sender.user, count, nudged, "companion replied");
    }
    Ok(())
}
