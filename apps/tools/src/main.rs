use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::{ConversationId, UserId};
use storage::Storage;

/// Administrative access to the server database.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
    },
    OpenDirect {
        user_id: i64,
        other_user_id: i64,
    },
    CreateGroup {
        creator_user_id: i64,
        local_key: String,
        name: String,
        #[arg(long = "member")]
        members: Vec<i64>,
    },
    AddParticipant {
        conversation_id: i64,
        user_id: i64,
    },
    ListMessages {
        conversation_id: i64,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { username } => {
            let user_id = storage.create_user(username.trim()).await?;
            println!("user_id={}", user_id.0);
        }
        Command::OpenDirect {
            user_id,
            other_user_id,
        } => {
            let conversation = storage
                .get_or_create_direct_conversation(UserId(user_id), UserId(other_user_id))
                .await?;
            println!(
                "conversation_id={} local_key={}",
                conversation.conversation_id.0, conversation.local_key
            );
        }
        Command::CreateGroup {
            creator_user_id,
            local_key,
            name,
            members,
        } => {
            let members: Vec<UserId> = members.into_iter().map(UserId).collect();
            let conversation = storage
                .create_group_conversation(&local_key, &name, UserId(creator_user_id), &members)
                .await?;
            println!(
                "conversation_id={} participants={}",
                conversation.conversation_id.0,
                conversation.participants.len()
            );
        }
        Command::AddParticipant {
            conversation_id,
            user_id,
        } => {
            storage
                .add_participant(ConversationId(conversation_id), UserId(user_id))
                .await?;
            println!("added user_id={user_id} to conversation_id={conversation_id}");
        }
        Command::ListMessages {
            conversation_id,
            limit,
        } => {
            let messages = storage
                .list_messages(ConversationId(conversation_id), limit, None)
                .await?;
            for message in messages {
                println!(
                    "{} [{}] {}: {}",
                    message.sent_at.to_rfc3339(),
                    message.id.as_str(),
                    message.sender_name,
                    message.content
                );
            }
        }
    }

    Ok(())
}
