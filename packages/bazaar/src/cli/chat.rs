//! `bazaar chat`: an interactive conversation on the terminal.

use anyhow::{Context, Result, bail};
use bazaar_chat::{ChatApi, ConversationSession, Message, MessageType, TypingStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::{Client, ClientArgs, format_message, spawn_state_reporter};
use crate::config::ClientSettings;

#[derive(clap::Args, Debug)]
pub struct ChatArgs {
    /// Conversation to open. Omit to start one with --provider/--service.
    pub conversation: Option<String>,

    /// Provider to contact when starting a conversation
    #[arg(long, requires = "service", conflicts_with = "conversation")]
    pub provider: Option<String>,

    /// Service the new conversation is about
    #[arg(long, requires = "provider")]
    pub service: Option<String>,

    /// Number of past messages to show
    #[arg(long, default_value_t = 50)]
    pub history: usize,

    #[command(flatten)]
    pub client: ClientArgs,
}

/// A line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Text(String),
    Media {
        kind: MessageType,
        url: String,
        caption: String,
    },
    Typing,
    Quit,
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let media = |kind, rest: &str| {
        let (url, caption) = rest.split_once(' ').unwrap_or((rest, ""));
        Input::Media {
            kind,
            url: url.to_string(),
            caption: caption.trim().to_string(),
        }
    };
    match line.split_once(' ') {
        None if line == "/quit" => Input::Quit,
        None if line == "/typing" => Input::Typing,
        Some(("/image", rest)) => media(MessageType::Image, rest.trim()),
        Some(("/file", rest)) => media(MessageType::File, rest.trim()),
        _ => Input::Text(line.to_string()),
    }
}

pub async fn chat_command(settings: ClientSettings, args: ChatArgs) -> Result<()> {
    let client = Client::new(&settings, &args.client)?;

    let conversation_id = match (args.conversation, args.provider, args.service) {
        (Some(id), _, _) => id,
        (None, Some(provider), Some(service)) => client
            .api
            .create_conversation(&provider, &service)
            .await
            .context("Failed to start conversation")?,
        _ => bail!("Pass a conversation id, or --provider and --service to start one"),
    };

    client.connect().await?;
    let me = client.connection.user_id();
    let _reporter = spawn_state_reporter(&client.connection);

    let session = ConversationSession::open(&client.connection, conversation_id.clone())
        .await
        .with_context(|| format!("Failed to join conversation {conversation_id}"))?;

    session
        .load_history(&client.api, args.history)
        .await
        .context("Failed to load message history")?;
    for message in session.messages() {
        println!("{}", format_message(&message, me.as_deref()));
    }
    if let Err(e) = client.api.mark_read(&conversation_id).await {
        debug!(error = %e, "mark read failed");
    }

    let events = client.connection.events();
    let printer_me = me.clone();
    let printer_id = conversation_id.clone();
    let _printer = events.on::<Message, _>(move |message| {
        if message.conversation_id == printer_id && Some(&message.sender_id) != printer_me.as_ref()
        {
            println!("{}", format_message(message, printer_me.as_deref()));
        }
    });
    let typing_id = conversation_id.clone();
    let _typing = events.on::<TypingStatus, _>(move |status| {
        if status.conversation_id == typing_id && status.is_typing {
            eprintln!("-- typing...");
        }
    });

    eprintln!("-- joined {conversation_id}. /quit to leave, /image <url> [caption] to share a photo");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let result = match parse_input(&line) {
            Input::Quit => break,
            Input::Empty => continue,
            Input::Typing => {
                session.set_typing(true);
                continue;
            }
            Input::Text(text) => session.send(&text).await,
            Input::Media { kind, url, caption } => {
                session.send_with(&caption, kind, Some(url)).await
            }
        };
        match result {
            Ok(message) => println!("{}", format_message(&message, me.as_deref())),
            Err(e) => eprintln!("-- not sent ({}): {e}", e.error_code()),
        }
    }

    session.close();
    client.connection.disconnect();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_input("  "), Input::Empty);
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input("/typing"), Input::Typing);
        assert_eq!(
            parse_input("hello there"),
            Input::Text("hello there".into())
        );
        // Unknown slash words are sent as text.
        assert_eq!(parse_input("/shrug"), Input::Text("/shrug".into()));
    }

    #[test]
    fn test_parse_media() {
        assert_eq!(
            parse_input("/image https://cdn/x.jpg the leak"),
            Input::Media {
                kind: MessageType::Image,
                url: "https://cdn/x.jpg".into(),
                caption: "the leak".into(),
            }
        );
        assert_eq!(
            parse_input("/file https://cdn/quote.pdf"),
            Input::Media {
                kind: MessageType::File,
                url: "https://cdn/quote.pdf".into(),
                caption: String::new(),
            }
        );
    }
}
