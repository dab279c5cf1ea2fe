use super::Context;
use crate::api::{ChatQuery, Message, Role};
use crate::history::HistoryOrigin;
use crate::session::{ChatEvent, ChatSession, SendOutcome};
use anyhow::{bail, Result};
use std::future::Future;
use std::io::{self, Write};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

/// Something typed at the chat prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Query(String),
    Clear,
    History,
    /// `/doc all` clears the filter.
    Document(Option<i64>),
    Quit,
    Unknown(String),
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Query(line.to_string());
    };
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("clear"), None) => Input::Clear,
        (Some("history"), None) => Input::History,
        (Some("quit") | Some("exit"), None) => Input::Quit,
        (Some("doc"), Some("all")) => Input::Document(None),
        (Some("doc"), Some(id)) => match id.parse() {
            Ok(id) => Input::Document(Some(id)),
            Err(_) => Input::Unknown(line.to_string()),
        },
        _ => Input::Unknown(line.to_string()),
    }
}

fn print_event(event: ChatEvent) {
    let mut out = io::stdout().lock();
    match event {
        ChatEvent::Delta(text) => {
            let _ = write!(out, "{}", text);
        }
        ChatEvent::Completed(_) => {
            let _ = writeln!(out);
        }
        ChatEvent::Cancelled(_) => {
            let _ = writeln!(out, "\n[cancelled]");
        }
        ChatEvent::Failed { partial, .. } => {
            if !partial.is_empty() {
                let _ = writeln!(out);
            }
            let _ = writeln!(out, "{}", crate::session::ERROR_MESSAGE);
        }
    }
    let _ = out.flush();
}

pub fn format_message(message: &Message) -> String {
    let label = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    format!("{:>9} │ {}", label, message.content.replace('\n', "\n          │ "))
}

fn print_transcript(messages: &[Message]) {
    for message in messages {
        println!("{}", format_message(message));
    }
}

/// Send one query, cancelling it (not the program) on Ctrl-C.
async fn send_interruptible(session: &ChatSession, query: &str) -> SendOutcome {
    let send = session.send_with(query, print_event);
    tokio::pin!(send);
    loop {
        tokio::select! {
            outcome = &mut send => return outcome,
            _ = tokio::signal::ctrl_c() => {
                session.cancel();
            }
        }
    }
}

/// Next line from the prompt, or `None` on end of input or when
/// `interrupt` fires first.
async fn next_input<R, I>(lines: &mut Lines<R>, interrupt: I) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = io::Result<()>>,
{
    tokio::select! {
        line = lines.next_line() => line,
        _ = interrupt => Ok(None),
    }
}

/// Interactive chat loop on stdin. Ctrl-C at the prompt leaves the loop.

pub async fn repl(ctx: &Context) -> Result<()> {
    let session = ctx.chat_session()?;
    if let Some(origin) = session.load_history().await {
        let messages = session.messages();
        if !messages.is_empty() {
            let source = match origin {
                HistoryOrigin::Remote => "server",
                HistoryOrigin::Local => "local backup",
            };
            println!("── {} earlier messages ({}) ──", messages.len(), source);
            print_transcript(&messages);
        }
    }
    println!("Ask a question about your documents. /clear, /history, /doc <id|all>, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = next_input(&mut lines, tokio::signal::ctrl_c()).await? else {
            println!();
            break;
        };
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Query(query) => {
                send_interruptible(&session, &query).await;
            }
            Input::Clear => {
                if session.clear().await {
                    println!("History cleared.");
                }
            }
            Input::History => print_transcript(&session.messages()),
            Input::Document(id) => {
                session.set_document_filter(id);
                match id {
                    Some(id) => println!("Answers restricted to document {}.", id),
                    None => println!("Searching all documents."),
                }
            }
            Input::Unknown(input) => println!("Unknown command: {}", input),
        }
    }

    session.flush().await;
    Ok(())
}

/// One-shot question. Streams by default; `no_stream` uses the buffered
/// endpoint and skips history.
pub async fn ask(ctx: &Context, question: &str, no_stream: bool) -> Result<()> {
    if no_stream {
        let answer = ctx
            .client
            .query(&ChatQuery {
                query: question.to_string(),
                document_id: ctx.config.document_id,
            })
            .await?;
        println!("{}", answer);
        return Ok(());
    }

    let session = ctx.chat_session()?;
    let outcome = send_interruptible(&session, question).await;
    session.flush().await;
    match outcome {
        SendOutcome::Completed | SendOutcome::Cancelled => Ok(()),
        SendOutcome::Failed => bail!("chat request failed"),
        SendOutcome::Rejected => bail!("question must not be empty"),
    }
}

pub async fn history(ctx: &Context) -> Result<()> {
    let session = ctx.chat_session()?;
    session.load_history().await;
    let messages = session.messages();
    if messages.is_empty() {
        println!("No chat history.");
    } else {
        print_transcript(&messages);
    }
    Ok(())
}

pub async fn clear(ctx: &Context) -> Result<()> {
    let session = ctx.chat_session()?;
    if !session.clear().await {
        bail!("session busy");
    }
    println!("History cleared.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("  "), Input::Empty);
        assert_eq!(
            parse_input(" What is RAG? "),
            Input::Query("What is RAG?".into())
        );
        assert_eq!(parse_input("/clear"), Input::Clear);
        assert_eq!(parse_input("/history"), Input::History);
        assert_eq!(parse_input("/exit"), Input::Quit);
        assert_eq!(parse_input("/doc 12"), Input::Document(Some(12)));
        assert_eq!(parse_input("/doc all"), Input::Document(None));
        assert_eq!(parse_input("/doc x"), Input::Unknown("/doc x".into()));
        assert_eq!(parse_input("/nope"), Input::Unknown("/nope".into()));
    }

    #[tokio::test]
    async fn test_next_input_reads_line_without_interrupt() {
        let mut lines = BufReader::new(&b"hello\nworld\n"[..]).lines();
        let line = next_input(&mut lines, std::future::pending()).await.unwrap();
        assert_eq!(line.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_next_input_interrupt_at_idle_prompt() {
        // Nothing is ever written, so the read stays pending.
        let (_writer, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();
        let line = next_input(&mut lines, async { Ok(()) }).await.unwrap();
        assert_eq!(line, None);
    }

    #[test]
    fn test_format_multiline_message() {
        let formatted = format_message(&Message::assistant("line one\nline two"));
        assert_eq!(
            formatted,
            "assistant │ line one\n          │ line two"
        );
    }
}
