//! Terminal client: one replica driven by typed commands.
//!
//! Lines from stdin become [`Command`]s on the dispatcher queue. Local
//! engine updates go out through the sync client; remote ones are applied
//! to the replica and flushed to the store's listeners.

use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use todo_collab::{user_id, LocalStorage, PeerInfo, SyncClient, SyncEvent};
use todo_core::{ChangeEvent, Command, DeliveryOrigin, Dispatcher, Replica, TodoStore, TodoView};

use crate::config::ClientArgs;

const HELP: &str = "\
commands:
  add <text>          new item
  done <n>            mark item n complete
  undo <n>            mark item n incomplete
  edit <n> <text>     replace item n's text
  rm <n>              remove item n
  toggle-all          complete all, or un-complete all when all are complete
  clear-completed     remove completed items
  list                print the list
  json                print the list as JSON
  connect             reconnect to the server
  {\"kind\": ...}       raw JSON command
  quit";

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    List,
    Json,
    Connect,
    Help,
    Quit,
    Invalid(String),
}

/// Parse one typed line. Item numbers are 1-based positions in `views`.
pub fn parse_input(line: &str, views: &[TodoView]) -> Input {
    let line = line.trim();
    if line.starts_with('{') {
        return match Command::from_json(line) {
            Ok(command) => Input::Command(command),
            Err(e) => Input::Invalid(format!("bad JSON command: {e}")),
        };
    }

    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let item = |arg: &str| -> Result<String, String> {
        let n: usize = arg.parse().map_err(|_| format!("not an item number: {arg:?}"))?;
        n.checked_sub(1)
            .and_then(|i| views.get(i))
            .map(|view| view.id.clone())
            .ok_or_else(|| format!("no item {n}"))
    };
    let command = |result: Result<Command, String>| match result {
        Ok(command) => Input::Command(command),
        Err(msg) => Input::Invalid(msg),
    };

    match word {
        "" => Input::Invalid(String::new()),
        "add" => Input::Command(Command::Create {
            text: rest.to_string(),
        }),
        "done" => command(item(rest).map(|id| Command::Complete { id })),
        "undo" => command(item(rest).map(|id| Command::UndoComplete { id })),
        "rm" => command(item(rest).map(|id| Command::Destroy { id })),
        "edit" => {
            let (n, text) = rest.split_once(' ').unwrap_or((rest, ""));
            command(item(n).map(|id| Command::UpdateText {
                id,
                text: text.trim().to_string(),
            }))
        }
        "toggle-all" => Input::Command(Command::ToggleCompleteAll),
        "clear-completed" => Input::Command(Command::DestroyCompleted),
        "list" | "ls" => Input::List,
        "json" => Input::Json,
        "connect" => Input::Connect,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command {other:?}, try `help`")),
    }
}

fn render(views: &[TodoView]) -> String {
    if views.is_empty() {
        return "  (nothing to do)".to_string();
    }
    let left = views.iter().filter(|v| !v.complete).count();
    let mut out = String::new();
    for (i, view) in views.iter().enumerate() {
        let mark = if view.complete { 'x' } else { ' ' };
        out.push_str(&format!("  {:>2}. [{mark}] {}\n", i + 1, view.text));
    }
    out.push_str(&format!("  {left} item{} left", if left == 1 { "" } else { "s" }));
    out
}

async fn connect(client: &mut SyncClient, replica: &Replica) {
    match client.connect(replica.state_vector()).await {
        Ok(()) => {}
        Err(e) => {
            log::warn!("working offline: {e}");
            println!("offline ({} queued), type `connect` to retry", client.offline_queue_len().await);
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<(), Box<dyn Error>> {
    let mut local = LocalStorage::open(&args.local_storage)?;
    let user = user_id(&mut local)?;
    println!("you are {user}");

    let replica = Replica::new();
    let store = Rc::new(RefCell::new(TodoStore::open(
        replica.clone(),
        &args.store_config(),
    )?));

    let dirty = Arc::new(AtomicBool::new(false));
    let flag = dirty.clone();
    store
        .borrow_mut()
        .add_change_listener(Arc::new(move |event: &ChangeEvent| {
            if event.origin == DeliveryOrigin::Remote {
                log::debug!("remote change");
            }
            flag.store(true, Ordering::Relaxed);
        }));

    let mut dispatcher = Dispatcher::default();
    dispatcher.register(store.clone());
    let commands = dispatcher.sender();

    let mut feed = replica.update_feed()?;
    let mut client = SyncClient::new(PeerInfo::new(user), args.client_config());
    let mut events = client
        .take_event_rx()
        .ok_or("sync event channel already taken")?;
    if !args.offline {
        connect(&mut client, &replica).await;
    }

    println!("{}", render(&store.borrow().get_all()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let views = store.borrow().get_all();
                match parse_input(&line, &views) {
                    Input::Command(command) => commands.submit(command).await?,
                    Input::List => println!("{}", render(&views)),
                    Input::Json => println!("{}", serde_json::to_string_pretty(&views)?),
                    Input::Connect => connect(&mut client, &replica).await,
                    Input::Help => println!("{HELP}"),
                    Input::Quit => break,
                    Input::Invalid(msg) if msg.is_empty() => {}
                    Input::Invalid(msg) => println!("{msg}"),
                }
            }
            Some(report) = dispatcher.next() => {
                for reason in report.rejections() {
                    println!("{} rejected: {reason}", report.command.kind());
                }
                store.borrow_mut().flush_deliveries();
            }
            Some(update) = feed.recv() => {
                if let Err(e) = client.send_update(update).await {
                    log::warn!("update dropped: {e}");
                }
            }
            Some(event) = events.recv() => {
                match event {
                    SyncEvent::RemoteUpdate { update, .. } | SyncEvent::Synced(update) => {
                        if let Err(e) = replica.apply_remote_update(&update) {
                            log::warn!("ignoring bad update: {e}");
                        }
                        store.borrow_mut().flush_deliveries();
                    }
                    SyncEvent::DiffRequested(sv) => match replica.encode_diff(&sv) {
                        Ok(diff) => {
                            if let Err(e) = client.send_sync_step2(diff).await {
                                log::warn!("could not answer sync: {e}");
                            }
                        }
                        Err(e) => log::warn!("bad state vector from host: {e}"),
                    },
                    SyncEvent::PeerJoined(info) => println!("* {} joined", info.name),
                    SyncEvent::PeerLeft(peer_id) => log::info!("peer {peer_id} left"),
                    SyncEvent::Connected => println!("* connected"),
                    SyncEvent::Disconnected => println!("* disconnected, edits are queued"),
                }
            }
        }

        if dirty.swap(false, Ordering::Relaxed) {
            println!("{}", render(&store.borrow().get_all()));
        }
    }

    client.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn views() -> Vec<TodoView> {
        vec![
            TodoView {
                id: "a1".into(),
                text: "Buy milk".into(),
                complete: false,
            },
            TodoView {
                id: "b2".into(),
                text: "Walk the dog".into(),
                complete: true,
            },
        ]
    }

    #[test]
    fn test_parse_item_commands() {
        let views = views();
        assert_eq!(
            parse_input("add  Feed the cat ", &views),
            Input::Command(Command::Create {
                text: "Feed the cat".into()
            })
        );
        assert_eq!(
            parse_input("done 1", &views),
            Input::Command(Command::Complete { id: "a1".into() })
        );
        assert_eq!(
            parse_input("undo 2", &views),
            Input::Command(Command::UndoComplete { id: "b2".into() })
        );
        assert_eq!(
            parse_input("edit 2 Walk the cat", &views),
            Input::Command(Command::UpdateText {
                id: "b2".into(),
                text: "Walk the cat".into()
            })
        );
        assert_eq!(
            parse_input("rm 1", &views),
            Input::Command(Command::Destroy { id: "a1".into() })
        );
    }

    #[test]
    fn test_parse_bad_item_numbers() {
        let views = views();
        assert_eq!(parse_input("done 3", &views), Input::Invalid("no item 3".into()));
        assert_eq!(parse_input("done 0", &views), Input::Invalid("no item 0".into()));
        assert!(matches!(parse_input("rm x", &views), Input::Invalid(_)));
    }

    #[test]
    fn test_parse_list_commands() {
        let views = views();
        assert_eq!(
            parse_input("toggle-all", &views),
            Input::Command(Command::ToggleCompleteAll)
        );
        assert_eq!(
            parse_input("clear-completed", &views),
            Input::Command(Command::DestroyCompleted)
        );
        assert_eq!(parse_input("list", &views), Input::List);
        assert_eq!(parse_input("json", &views), Input::Json);
        assert_eq!(parse_input("quit", &views), Input::Quit);
        assert_eq!(parse_input("  ", &views), Input::Invalid(String::new()));
        assert!(matches!(parse_input("frobnicate", &views), Input::Invalid(_)));
    }

    #[test]
    fn test_parse_json_command() {
        assert_eq!(
            parse_input(r#"{"kind":"DESTROY","id":"a1"}"#, &[]),
            Input::Command(Command::Destroy { id: "a1".into() })
        );
        assert_eq!(
            parse_input(r#"{"kind":"SOMETHING_NEW"}"#, &[]),
            Input::Command(Command::Unknown)
        );
        assert!(matches!(parse_input("{oops", &[]), Input::Invalid(_)));
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&[]), "  (nothing to do)");
        let out = render(&views());
        assert!(out.contains(" 1. [ ] Buy milk"));
        assert!(out.contains(" 2. [x] Walk the dog"));
        assert!(out.ends_with("1 item left"));
    }
}
