use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::connection::handle_client;
use crate::logger::Logger;
use crate::sink::MailSink;

/// Accepted-but-unhandled connections wait here. Generous enough that the
/// handoff is never the limiting factor under normal load.
const HANDOFF_CAPACITY: usize = 50_000;

/// Accepts connections and feeds them into the bounded handoff channel
/// until shutdown begins. Accept errors are logged and skipped. Dropping
/// the listener on return closes the listening socket.
async fn accept_loop(
    listener: TcpListener,
    handoff: mpsc::Sender<(TcpStream, SocketAddr)>,
    mut stop_rx: watch::Receiver<bool>,
    logger: Logger,
) {
    loop {
        // Covers a stop that lands between subscribing and selecting.
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        // A full handoff channel must not pin this task
                        // past shutdown, so the send is cancellable too.
                        tokio::select! {
                            sent = handoff.send((stream, peer)) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                            _ = stop_rx.changed() => break,
                        }
                    }
                    Err(e) => {
                        logger.log(&format!("Accept error: {}", e));
                    }
                }
            }
            _ = stop_rx.changed() => break,
        }
    }
}

/// Supervises one bound endpoint: pulls accepted connections off the
/// handoff channel and spawns a worker per connection, plain or TLS alike.
/// On shutdown it stops taking new connections and returns; in-flight
/// workers are drained elsewhere.
pub async fn serve(listener: TcpListener, tls: Option<TlsAcceptor>, sink: Arc<MailSink>) {
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    sink.logger.log(&format!("Started listener on {}", local));

    let (handoff_tx, mut handoff_rx) = mpsc::channel(HANDOFF_CAPACITY);
    let mut stop_rx = sink.shutdown.subscribe();
    let accepting = tokio::spawn(accept_loop(
        listener,
        handoff_tx,
        sink.shutdown.subscribe(),
        sink.logger.clone(),
    ));

    loop {
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            handed = handoff_rx.recv() => {
                let (stream, peer) = match handed {
                    Some(pair) => pair,
                    None => break,
                };
                // Claim the drain slot before the worker task exists so
                // shutdown can never miss it.
                let guard = sink.shutdown.track_connection();
                let sink = Arc::clone(&sink);
                let tls = tls.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    sink.logger.log(&format!("Handling connection from {}", peer));
                    let result = match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => handle_client(tls_stream, peer, &sink).await,
                            Err(e) => {
                                sink.logger
                                    .log(&format!("TLS handshake with {} failed: {}", peer, e));
                                Ok(())
                            }
                        },
                        None => handle_client(stream, peer, &sink).await,
                    };
                    if let Err(e) = result {
                        sink.logger.log(&format!("Connection {} errored: {}", peer, e));
                    }
                    sink.logger.log(&format!("Done handling connection from {}", peer));
                });
            }
            _ = stop_rx.changed() => break,
        }
    }

    let _ = accepting.await;
    sink.logger.log(&format!("Stopped listener on {}", local));
}
