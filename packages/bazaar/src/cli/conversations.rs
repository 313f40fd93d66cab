//! `bazaar conversations`: list conversations, optionally following activity.

use anyhow::{Context, Result};
use bazaar_chat::{ActivityNotification, ConversationList, ConversationSummary};

use super::{Client, ClientArgs, spawn_state_reporter};
use crate::config::ClientSettings;

#[derive(clap::Args, Debug)]
pub struct ConversationsArgs {
    /// Print rows as JSON
    #[arg(long)]
    pub json: bool,

    /// Stay connected and print rows as activity arrives
    #[arg(short, long)]
    pub watch: bool,

    #[command(flatten)]
    pub client: ClientArgs,
}

fn format_row(row: &ConversationSummary) -> String {
    let when = row
        .last_message_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let unread = if row.unread_count > 0 {
        format!(" ({} unread)", row.unread_count)
    } else {
        String::new()
    };
    format!(
        "{}  {:<16} {}  {}{}",
        row.id,
        row.other_party,
        when,
        row.last_message_text.as_deref().unwrap_or(""),
        unread
    )
}

pub async fn conversations_command(settings: ClientSettings, args: ConversationsArgs) -> Result<()> {
    let client = Client::new(&settings, &args.client)?;
    let list = ConversationList::default();
    list.refresh(&client.api)
        .await
        .context("Failed to fetch conversations")?;

    let rows = list.sorted_by_recent();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("No conversations");
    } else {
        for row in &rows {
            println!("{}", format_row(row));
        }
    }

    if !args.watch {
        return Ok(());
    }

    client.connect().await?;
    let _reporter = spawn_state_reporter(&client.connection);
    let _reconciler = list.attach(client.connection.events());
    let printer = list.clone();
    let json = args.json;
    // Registered after the reconciler, so the row is already updated here.
    let _printer = client
        .connection
        .events()
        .on::<ActivityNotification, _>(move |notification| {
            let Some(row) = printer.get(&notification.conversation_id) else {
                return;
            };
            if json {
                match serde_json::to_string(&row) {
                    Ok(line) => println!("{line}"),
                    Err(e) => eprintln!("-- failed to render row: {e}"),
                }
            } else {
                println!("{}", format_row(&row));
            }
        });

    eprintln!("-- watching for activity, ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    client.connection.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_format_row() {
        let mut row = ConversationSummary {
            id: "c1".into(),
            other_party: "bob".into(),
            service_id: None,
            last_message_text: Some("see you at 3".into()),
            last_message_at: Some(Utc.with_ymd_and_hms(2026, 3, 1, 14, 5, 0).unwrap()),
            unread_count: 2,
        };
        assert_eq!(
            format_row(&row),
            "c1  bob              2026-03-01 14:05  see you at 3 (2 unread)"
        );

        row.unread_count = 0;
        row.last_message_at = None;
        row.last_message_text = None;
        assert_eq!(format_row(&row), "c1  bob              -  ");
    }
}
