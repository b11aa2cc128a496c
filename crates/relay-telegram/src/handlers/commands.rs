use relay_core::utils::parse_command;

use crate::router::AppState;

use super::Sender;

/// Where a parsed command is handled.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Route {
    Start,
    Connect,
    Disconnect,
    Operator,
}

pub(crate) fn route(cmd: &str) -> Route {
    match cmd {
        "start" => Route::Start,
        "connect" => Route::Connect,
        "disconnect" => Route::Disconnect,
        _ => Route::Operator,
    }
}

pub(crate) async fn handle_command(
    state: &AppState,
    sender: &Sender,
    text: &str,
) -> anyhow::Result<()> {
    let (cmd, args) = parse_command(text);
    tracing::debug!(user = %sender.user, command = %cmd, "command received");

    match route(&cmd) {
        Route::Start => {
            state
                .conversation
                .on_start(sender.user, &sender.display_name, sender.username.as_deref())
                .await?;
        }
        Route::Connect => {
            state
                .conversation
                .connect(sender.user, &sender.display_name)
                .await?;
        }
        Route::Disconnect => state.conversation.disconnect(sender.user).await?,
        Route::Operator => {
            let handled = state.admin.handle(sender.user, &cmd, &args).await?;
            if !handled && state.cfg.is_admin(sender.user) {
                state.admin.help().await?;
            }
        }
    }
    Ok(())
}
