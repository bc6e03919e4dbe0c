//! Line-oriented console front end
//!
//! Reads lines from stdin and prints the transcript to stdout. The first
//! line is the username unless one was given up front; a refused name
//! prompts again. `/users` asks for the roster and `/quit` leaves.

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::MAX_MESSAGE_CHARS;
use crate::error::AppError;
use crate::transport::{ChatClient, ClientEvent};
use crate::types::User;

const USERS_COMMAND: &str = "/users";
const QUIT_COMMAND: &str = "/quit";
const USERNAME_PROMPT: &str = "username: ";

/// Event buffer between the read loop and the console
const EVENT_BUFFER: usize = 64;

/// Roster-aware transcript renderer
#[derive(Debug, Default)]
pub struct Transcript {
    /// Identity -> username, from the latest roster
    users: HashMap<String, String>,
}

impl Transcript {
    /// Render one event as a transcript line
    pub fn render(&mut self, event: &ClientEvent) -> String {
        match event {
            ClientEvent::Message(message) => {
                let sender = self
                    .users
                    .get(&message.sender_id)
                    .map(String::as_str)
                    .unwrap_or("unknown");
                format!("[{}]: {}", sender, message.text)
            }
            ClientEvent::Users(users) => {
                self.replace_roster(users);
                let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
                format!("* online ({}): {}", names.len(), names.join(", "))
            }
            ClientEvent::Error(text) => format!("! {}", text),
            ClientEvent::Disconnected => "* disconnected from server".to_string(),
        }
    }

    fn replace_roster(&mut self, users: &[User]) {
        self.users = users
            .iter()
            .map(|u| (u.id.clone(), u.username.clone()))
            .collect();
    }
}

/// Where the console is in joining the chat
#[derive(Debug, Clone, PartialEq, Eq)]
enum Registration {
    /// The next line is a username
    NeedsName,
    /// Register sent as this name, no answer yet
    Joining(String),
    Joined,
}

impl Registration {
    /// Advance on a server event
    ///
    /// A roster listing our name confirms the join. An error before that is
    /// the server refusing the name.
    fn observe(&mut self, event: &ClientEvent) {
        let Registration::Joining(name) = self else {
            return;
        };
        let next = match event {
            ClientEvent::Users(users) if users.iter().any(|u| u.username == *name) => Registration::Joined,
            ClientEvent::Error(_) => Registration::NeedsName,
            _ => return,
        };
        *self = next;
    }
}

/// What one stdin line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Skip,
    Quit,
    Register(String),
    ListUsers,
    Send(String),
    /// Not sent; show this instead
    Notice(String),
}

fn interpret(registration: &Registration, line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Skip;
    }
    if trimmed == QUIT_COMMAND {
        return Input::Quit;
    }
    match registration {
        Registration::NeedsName => Input::Register(trimmed.to_string()),
        Registration::Joining(_) => Input::Notice("still joining, line not sent".to_string()),
        Registration::Joined if trimmed == USERS_COMMAND => Input::ListUsers,
        Registration::Joined if line.chars().count() > MAX_MESSAGE_CHARS => Input::Notice(format!(
            "message must be at most {} characters, not sent",
            MAX_MESSAGE_CHARS
        )),
        Registration::Joined => Input::Send(line.to_string()),
    }
}

async fn print_line(stdout: &mut Stdout, line: &str) -> Result<(), AppError> {
    stdout.write_all(format!("{}\n", line).as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn prompt(stdout: &mut Stdout) -> Result<(), AppError> {
    stdout.write_all(USERNAME_PROMPT.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

/// Connect to `address` and run the interactive session
pub async fn run(address: &str, username: Option<String>, max_frame_length: usize) -> Result<(), AppError> {
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
    let (mut client, reader) =
        ChatClient::connect_with_max_frame_length(address, events_tx, max_frame_length).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    let mut registration = Registration::NeedsName;
    match username.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => {
            client.register(name).await?;
            registration = Registration::Joining(name.to_string());
        }
        _ => prompt(&mut stdout).await?,
    }

    let mut transcript = Transcript::default();
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let event = event.unwrap_or(ClientEvent::Disconnected);
                print_line(&mut stdout, &transcript.render(&event)).await?;
                if event == ClientEvent::Disconnected {
                    break;
                }

                let was_joining = matches!(registration, Registration::Joining(_));
                registration.observe(&event);
                if was_joining && registration == Registration::NeedsName {
                    prompt(&mut stdout).await?;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                match interpret(&registration, &line) {
                    Input::Skip => {
                        if registration == Registration::NeedsName {
                            prompt(&mut stdout).await?;
                        }
                    }
                    Input::Quit => break,
                    Input::Register(name) => {
                        client.register(&name).await?;
                        registration = Registration::Joining(name);
                    }
                    Input::ListUsers => client.request_users().await?,
                    Input::Send(text) => {
                        client.send_message(&text).await?;
                        print_line(&mut stdout, &format!("[you]: {}", text)).await?;
                    }
                    Input::Notice(text) => print_line(&mut stdout, &format!("! {}", text)).await?,
                }
            }
        }
    }

    let _ = client.close().await;
    reader.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;

    #[test]
    fn test_message_uses_roster_name() {
        let mut transcript = Transcript::default();
        let roster = ClientEvent::Users(vec![
            User {
                id: "a".to_string(),
                username: "alice".to_string(),
            },
            User {
                id: "b".to_string(),
                username: "bob".to_string(),
            },
        ]);
        assert_eq!(transcript.render(&roster), "* online (2): alice, bob");

        let message = ClientEvent::Message(ChatMessage {
            sender_id: "b".to_string(),
            text: "hi".to_string(),
        });
        assert_eq!(transcript.render(&message), "[bob]: hi");
    }

    #[test]
    fn test_unknown_sender() {
        let mut transcript = Transcript::default();
        let message = ClientEvent::Message(ChatMessage {
            sender_id: "ghost".to_string(),
            text: "boo".to_string(),
        });
        assert_eq!(transcript.render(&message), "[unknown]: boo");
        assert_eq!(
            transcript.render(&ClientEvent::Error("nope".to_string())),
            "! nope"
        );
    }

    fn roster(names: &[&str]) -> ClientEvent {
        ClientEvent::Users(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| User {
                    id: i.to_string(),
                    username: name.to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_refused_name_asks_again() {
        let mut registration = Registration::Joining("alice".to_string());
        registration.observe(&roster(&["bob"]));
        assert_eq!(registration, Registration::Joining("alice".to_string()));

        registration.observe(&ClientEvent::Error("server is full, try again later".to_string()));
        assert_eq!(registration, Registration::NeedsName);
        assert_eq!(
            interpret(&registration, "  carol "),
            Input::Register("carol".to_string())
        );
    }

    #[test]
    fn test_joined_once_roster_lists_us() {
        let mut registration = Registration::Joining("alice".to_string());
        registration.observe(&roster(&["alice", "bob"]));
        assert_eq!(registration, Registration::Joined);

        // Later errors are about messages, not the name
        registration.observe(&ClientEvent::Error("nope".to_string()));
        assert_eq!(registration, Registration::Joined);
    }

    #[test]
    fn test_lines_before_join_are_held_back() {
        let joining = Registration::Joining("alice".to_string());
        assert!(matches!(interpret(&joining, "hello"), Input::Notice(_)));
        assert!(matches!(interpret(&joining, USERS_COMMAND), Input::Notice(_)));
        assert_eq!(interpret(&joining, QUIT_COMMAND), Input::Quit);
        assert_eq!(interpret(&Registration::NeedsName, "   "), Input::Skip);
    }

    #[test]
    fn test_only_sendable_lines_are_sent() {
        let joined = Registration::Joined;
        assert_eq!(interpret(&joined, USERS_COMMAND), Input::ListUsers);

        let longest = "a".repeat(MAX_MESSAGE_CHARS);
        assert_eq!(interpret(&joined, &longest), Input::Send(longest.clone()));
        assert!(matches!(
            interpret(&joined, &format!("{}a", longest)),
            Input::Notice(_)
        ));
    }
}
