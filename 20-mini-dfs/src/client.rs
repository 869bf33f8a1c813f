use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    command::ClientCommand,
    identity::{NodeIdentity, Role},
    protocol::{read_line, read_message, within, write_line, write_message},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let leaving = run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input).await?;
    if leaving {
        drain_replies(&mut reader).await?;
    }
    shutdown_connection(&mut writer).await;

    Ok(())
}

/// Connects and exchanges identities. The coordinator must answer as a
/// coordinator.
async fn establish_connection(args: &ClientArgs) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = within(args.connect_timeout(), TcpStream::connect(args.server))
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    let local = stream.local_addr()?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let me = NodeIdentity::new(local.ip().to_string(), local.port(), 0, Role::Client);
    write_message(&mut writer, &me).await?;
    let Some(coordinator) = read_message::<_, NodeIdentity>(&mut reader).await? else {
        bail!("{} closed the connection during the handshake", args.server);
    };
    if coordinator.role != Role::Coordinator {
        bail!("{} answered as a {} node, not a coordinator", args.server, coordinator.role);
    }

    info!(%coordinator, "connected");
    Ok((reader, writer))
}

/// Relays stdin to the coordinator and prints every reply line. Returns
/// `true` when the user ended the session with `logout` or `shutdown`.
async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<bool> {
    loop {
        input.clear();
        select! {
            server_line = read_line(reader) => {
                if !handle_server_line(server_line?).await? {
                    return Ok(false);
                }
            }
            bytes_read = stdin.read_line(input) => {
                if bytes_read? == 0 {
                    return Ok(false);
                }
                let text = input.trim();
                if text.is_empty() {
                    continue;
                }
                write_line(writer, text).await?;
                if ClientCommand::parse(text).is_ok_and(|command| command.ends_session()) {
                    return Ok(true);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                return Ok(false);
            }
        }
    }
}

/// Prints what is still in flight until the coordinator hangs up.
async fn drain_replies(reader: &mut BufReader<OwnedReadHalf>) -> Result<()> {
    while handle_server_line(read_line(reader).await?).await? {}
    Ok(())
}

async fn handle_server_line(line: Option<String>) -> Result<bool> {
    match line {
        Some(line) => {
            write_stdout(&line).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** coordinator closed the connection").await?;
            Ok(false)
        }
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
