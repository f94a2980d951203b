//! WaCRM inbox
//!
//! Command-line view of one tenant's inbox: lists the tickets of a status
//! tab, optionally prints a conversation grouped by day, then follows live
//! updates until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use wacrm::api::Backend;
use wacrm::config::Settings;
use wacrm::messages::group_by_day;
use wacrm::model::{TicketId, TicketStatus};
use wacrm::notify::NoticeLevel;
use wacrm::sync::Session;

#[derive(Debug, Parser)]
#[command(name = "wacrm-inbox", version, about = "Follow a WhatsApp CRM inbox from the terminal")]
struct Args {
    /// Settings file; WACRM_* environment variables override it
    #[arg(long, default_value = "wacrm.json")]
    settings: PathBuf,

    /// Status tab to show
    #[arg(long, default_value = "OPEN")]
    status: TicketStatus,

    /// Ticket whose conversation should be printed
    #[arg(long)]
    ticket: Option<TicketId>,

    /// Print the kanban board before following updates
    #[arg(long)]
    board: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wacrm::init();
    let args = Args::parse();

    let mut settings = Settings::load(&args.settings)
        .with_context(|| format!("loading {}", args.settings.display()))?;
    settings.apply_env();
    settings.validate().context("invalid settings")?;

    let (session, mut notices) = Session::start(settings, args.status)
        .await
        .context("starting session")?;

    print_tickets(&session).await;

    if args.board {
        match session.backend().kanban_board().await {
            Ok(columns) => {
                for column in columns {
                    let name = column.step.name.as_deref().unwrap_or("(unnamed)");
                    println!("[{}] {} ({} tickets)", column.step.id, name, column.tickets.len());
                }
            }
            Err(e) => warn!("Board unavailable: {}", e),
        }
    }

    if let Some(ticket_id) = args.ticket {
        if session.select_ticket(Some(ticket_id)).await.is_ok() {
            let messages = session.messages().messages().await;
            for group in group_by_day(&messages, &chrono::Local::now()) {
                println!("--- {} ---", group.label);
                for message in group.messages {
                    let who = if message.from_me { "me" } else { "them" };
                    println!(
                        "  {:>4} {} {}",
                        who,
                        message.status.status_indicator(),
                        message.content
                    );
                }
            }
        }
    }

    info!("Following live updates, press Ctrl-C to quit");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => match notice {
                Some(notice) => match notice.level {
                    NoticeLevel::Info => println!("* {}", notice.message),
                    NoticeLevel::Error => eprintln!("! {}", notice.message),
                },
                None => break,
            },
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn print_tickets(session: &Session) {
    let (status, tickets) = session.tickets().view().await;
    println!("{} tickets: {}", status, tickets.len());
    for ticket in tickets {
        let contact = ticket
            .contact
            .as_ref()
            .map(|c| c.display_name().to_string())
            .unwrap_or_else(|| "-".to_string());
        let step = ticket
            .kanban_step
            .as_ref()
            .and_then(|s| s.name.clone())
            .unwrap_or_default();
        let preview = ticket
            .last_message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        println!("#{:<6} {:<24} {:<16} {}", ticket.id, contact, step, preview);
    }
}
