//! Client worker pool.
//!
//! Each worker owns one TCP connection and runs rounds until it fails:
//! build a packet seeded with the round number, send it as a frame, read the
//! echoed frame and check that it is the exact byte reversal of what was sent.
//! The pool completes as soon as the first worker does.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

use crate::config::ClientConfig;
use crate::error::{NetsumError, Result};
use crate::framing::{check_range, read_frame_header, read_fully, write_frame};
use crate::packet::create_packet;
use crate::throughput::Throughput;

/// Run `config.threads` workers until the first one finishes or the process
/// is interrupted.
pub async fn run(config: ClientConfig) -> Result<()> {
    run_until(config, async {
        // A failed signal listener must not look like an interrupt.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Like [`run`], but interrupted by `interrupt` instead of Ctrl-C.
pub async fn run_until<F>(config: ClientConfig, interrupt: F) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    if config.threads == 0 {
        return Err(NetsumError::InvalidArgument(format!(
            "No threads: {}",
            config.threads
        )));
    }

    let (meter, _reporter) = Throughput::start(&Handle::current(), "client", config.report_interval);
    let address = format!("{}:{}", config.host, config.port);

    let mut workers = JoinSet::new();
    for id in 0..config.threads {
        let worker = Worker {
            address: address.clone(),
            packet_size: config.packet_size,
            meter: meter.clone(),
        };
        workers.spawn(
            async move { worker.run().await }.instrument(tracing::info_span!("client", id)),
        );
    }

    let outcome = tokio::select! {
        first = first_completion(&mut workers) => first,
        _ = interrupt => {
            info!("Interrupted");
            Err(NetsumError::Interrupted)
        }
    };

    if let Err(ref e) = outcome {
        if !matches!(e, NetsumError::Interrupted) {
            error!(error = %e, "Execution failed");
        }
    }

    debug!(rate = meter.rate(), "Final decayed rate");

    // Remaining workers keep running until the process exits.
    workers.detach_all();
    meter.stop();
    outcome
}

/// Outcome of whichever worker finishes first.
async fn first_completion(workers: &mut JoinSet<Result<()>>) -> Result<()> {
    match workers.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(NetsumError::WorkerPanicked(e)),
        None => Err(NetsumError::InvalidArgument(
            "no workers to wait for".to_string(),
        )),
    }
}

/// One client connection.
struct Worker {
    address: String,
    packet_size: usize,
    meter: Throughput,
}

impl Worker {
    async fn run(self) -> Result<()> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        debug!(address = %self.address, "Connected");

        let (mut reader, mut writer) = stream.into_split();
        exchange_rounds(&mut reader, &mut writer, self.packet_size, &self.meter).await
    }
}

/// Send packets and verify echoes until an error occurs.
pub async fn exchange_rounds<R, W>(
    reader: &mut R,
    writer: &mut W,
    packet_size: usize,
    meter: &Throughput,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut packet = vec![0u8; packet_size];
    let mut response = vec![0u8; packet_size];
    let mut round: u64 = 0;

    loop {
        exchange_round(reader, writer, &mut packet, &mut response, round).await?;
        meter.add(packet_size as u64);
        round += 1;
    }
}

/// Perform one request/response round with the packet buffers supplied.
pub async fn exchange_round<R, W>(
    reader: &mut R,
    writer: &mut W,
    packet: &mut [u8],
    response: &mut [u8],
    round: u64,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let length = packet.len();
    check_range(0, length, response.len())?;
    create_packet(packet, 0, length, round)?;
    write_frame(writer, packet, 0, length).await?;

    let received = read_frame_header(reader).await?;
    if received != length {
        return Err(NetsumError::ResponseLengthMismatch {
            expected: length,
            actual: received,
        });
    }
    read_fully(reader, &mut response[..length]).await?;

    verify_response(&response[..length], packet)
}

/// Check that `response` is `sent` in reverse byte order.
pub fn verify_response(response: &[u8], sent: &[u8]) -> Result<()> {
    if response.len() != sent.len() {
        return Err(NetsumError::ResponseLengthMismatch {
            expected: sent.len(),
            actual: response.len(),
        });
    }

    if let Some(position) = response
        .iter()
        .zip(sent.iter().rev())
        .position(|(got, want)| got != want)
    {
        return Err(NetsumError::MalformedResponse {
            position,
            sent: hex::encode_upper(sent),
            received: hex::encode_upper(response),
        });
    }
    Ok(())
}
