//! Line-oriented chat client.
//!
//! ```text
//! /who            list contacts with presence and unseen counts
//! /open <name>    open the conversation with a contact (name prefix or id)
//! /refresh        reload the open conversation
//! /quit           exit
//! anything else   send to the open conversation
//! ```

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use parley_client::{live, ApiClient, ChatClient, ClientConfig};
use parley_shared::protocol::ServerEvent;
use parley_shared::types::UserId;
use parley_shared::Message;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,parley_client=info")),
        )
        .init();

    let config = ClientConfig::from_env();
    let api = ApiClient::new(&config.server_url)?;

    let me = match config.user_id {
        Some(id) => id,
        None => {
            let name = std::env::args()
                .nth(1)
                .ok_or_else(|| anyhow::anyhow!("set PARLEY_USER_ID or pass a name to register"))?;
            let user = api.register_user(&name).await?;
            println!("registered {} as {}", user.full_name, user.id);
            user.id
        }
    };

    let client = ChatClient::new(api, me);
    client.load_contacts().await?;
    print_contacts(&client);

    let mut live = live::connect(&client.api().live_url(me)?).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = live.recv() => {
                let Some(event) = event else {
                    println!("* connection lost");
                    break;
                };
                let shown = match &event {
                    ServerEvent::MessageDelivered(m) => Some(m.clone()),
                    ServerEvent::PresenceRosterChanged(_) => None,
                };
                client.handle_event(event).await;
                if let Some(message) = shown {
                    let open = client.with_session(|s| s.view().is_some_and(|v| v.contains(message.id)));
                    if open {
                        print_message(&client, &message);
                    } else {
                        println!("* new message from {}", name_of(&client, message.sender_id));
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&client, line.trim()).await {
                    break;
                }
            }
        }

        for notice in client.with_session(|s| s.take_notices()) {
            println!("! {notice}");
        }
    }

    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(client: &ChatClient, line: &str) -> bool {
    match line.split_once(' ').unwrap_or((line, "")) {
        ("", _) => {}
        ("/quit", _) => return false,
        ("/who", _) => {
            if let Err(e) = client.load_contacts().await {
                println!("! {e}");
            }
            print_contacts(client);
        }
        ("/open", query) => match find_contact(client, query.trim()) {
            Some(peer) => {
                client.open_conversation(peer).await;
                print_conversation(client);
            }
            None => println!("! no contact matches '{}'", query.trim()),
        },
        ("/refresh", _) => {
            client.refresh().await;
            print_conversation(client);
        }
        _ => match client.with_session(|s| s.active_peer()) {
            Some(peer) => {
                if let Ok(message) = client.send(peer, Some(line.to_string()), None).await {
                    print_message(client, &message);
                }
            }
            None => println!("! open a conversation first (/open <name>)"),
        },
    }
    true
}

fn find_contact(client: &ChatClient, query: &str) -> Option<UserId> {
    if let Ok(id) = UserId::parse(query) {
        return Some(id);
    }
    let query = query.to_lowercase();
    client.with_session(|s| {
        s.contacts()
            .iter()
            .find(|u| u.full_name.to_lowercase().starts_with(&query))
            .map(|u| u.id)
    })
}

fn name_of(client: &ChatClient, id: UserId) -> String {
    client.with_session(|s| {
        if id == s.me() {
            return "me".to_string();
        }
        s.contacts()
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.full_name.clone())
            .unwrap_or_else(|| id.short())
    })
}

fn print_contacts(client: &ChatClient) {
    let rows: Vec<String> = client.with_session(|s| {
        s.contacts()
            .iter()
            .map(|u| {
                let dot = if s.is_online(u.id) { "●" } else { "○" };
                match s.unseen_from(u.id) {
                    0 => format!("{dot} {}", u.full_name),
                    n => format!("{dot} {} ({n} unseen)", u.full_name),
                }
            })
            .collect()
    });
    for row in rows {
        println!("{row}");
    }
}

fn print_conversation(client: &ChatClient) {
    let messages: Vec<Message> =
        client.with_session(|s| s.view().map(|v| v.messages().to_vec()).unwrap_or_default());
    for message in &messages {
        print_message(client, message);
    }
}

fn print_message(client: &ChatClient, message: &Message) {
    let body = match (&message.text, &message.media_url) {
        (Some(text), Some(url)) => format!("{text} [{url}]"),
        (Some(text), None) => text.clone(),
        (None, Some(url)) => format!("[{url}]"),
        (None, None) => String::new(),
    };
    println!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        name_of(client, message.sender_id),
        body
    );
}
