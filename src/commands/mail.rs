//! `gt mail` - agent messaging.

use clap::{Args, Subcommand};
use serde::Serialize;

use crate::beads::Beads;
use crate::commands::print_json;
use crate::mail::protocol::{self, ProtocolKind};
use crate::mail::{Message, Priority, Router};
use crate::workspace;

#[derive(Debug, Subcommand)]
pub enum MailCommand {
    /// Send a message to an agent.
    Send(SendArgs),
    /// List and classify an agent's messages.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Recipient address (e.g. greenplace/witness).
    pub to: String,
    /// Message body.
    pub body: String,
    /// Subject line.
    #[arg(short, long)]
    pub subject: String,
    /// Sender identity (default: self).
    #[arg(long, default_value = "")]
    pub from: String,
    /// High importance.
    #[arg(long)]
    pub urgent: bool,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Mailbox address to read.
    pub address: String,
    #[arg(long)]
    pub json: bool,
}

pub fn execute(command: MailCommand) -> anyhow::Result<()> {
    match command {
        MailCommand::Send(args) => run_send(args),
        MailCommand::Check(args) => run_check(args),
    }
}

fn run_send(args: SendArgs) -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd()?;
    let router = Router::new(&town_root);

    let from = if args.from.is_empty() {
        crate::sling::self_identity()
    } else {
        args.from.clone()
    };

    router.send(&Message {
        to: args.to.clone(),
        from,
        subject: args.subject,
        body: args.body,
        priority: if args.urgent {
            Priority::High
        } else {
            Priority::Normal
        },
    })?;
    println!("Mail sent to {}", args.to);
    Ok(())
}

#[derive(Debug, Serialize)]
struct ClassifiedMessage {
    kind: &'static str,
    from: String,
    subject: String,
    created_at: String,
}

fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let town_root = workspace::find_from_cwd()?;
    let beads = Beads::new(&town_root);

    let messages = beads.list_messages(&args.address)?;
    let classified: Vec<ClassifiedMessage> = messages
        .iter()
        .map(|m| ClassifiedMessage {
            kind: protocol::classify(&m.subject).as_str(),
            from: m.from.clone(),
            subject: m.subject.clone(),
            created_at: m.created_at.clone(),
        })
        .collect();

    if args.json {
        return print_json(&classified);
    }

    if classified.is_empty() {
        println!("No messages for {}", args.address);
        return Ok(());
    }
    println!("Messages for {}:", args.address);
    for m in &classified {
        println!("  [{}] {} - {}", m.kind, m.from, m.subject);
    }

    // Surface help requests that have a mechanical fix; the rest are for
    // their supervisor to judge.
    for message in &messages {
        if protocol::classify(&message.subject) != ProtocolKind::Help {
            continue;
        }
        if let Ok(help) = protocol::parse_help(&message.subject, &message.body) {
            let assessment = protocol::assess_help_request(&help);
            if assessment.can_help {
                println!("  -> {} can be handled: {}", help.topic, assessment.help_action);
            } else {
                println!("  -> {} escalates: {}", help.topic, assessment.escalation_reason);
            }
        }
    }
    Ok(())
}
