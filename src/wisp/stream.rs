//! Stream handling for proxied TCP/UDP connections

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::select;
use tracing::trace;
use wisp_mux::packet::{CloseReason, ConnectPacket, StreamType};
use wisp_mux::stream::MuxStream;
use wisp_mux::ws::WebSocketWrite;

/// An active destination socket (TCP or UDP)
pub enum ClientStream {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Close reason reported to the client for a failed connect.
pub fn connect_error_reason(err: &anyhow::Error) -> CloseReason {
    match err
        .downcast_ref::<std::io::Error>()
        .map(std::io::Error::kind)
    {
        Some(std::io::ErrorKind::ConnectionRefused) => CloseReason::ServerStreamConnectionRefused,
        Some(std::io::ErrorKind::TimedOut) => CloseReason::ServerStreamConnectionTimedOut,
        _ => CloseReason::Unexpected,
    }
}

/// Connect to the already-resolved destination address
pub async fn connect_stream(ip: IpAddr, packet: &ConnectPacket) -> Result<ClientStream> {
    match packet.stream_type {
        StreamType::Tcp => {
            let stream = TcpStream::connect(SocketAddr::new(ip, packet.port))
                .await
                .with_context(|| format!("Failed to connect to {}:{}", packet.host, packet.port))?;

            // Enable TCP_NODELAY for lower latency
            let _ = stream.set_nodelay(true);

            Ok(ClientStream::Tcp(stream))
        }
        StreamType::Udp => {
            let bind_addr = if ip.is_ipv4() {
                SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
            } else {
                SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
            };

            let socket = UdpSocket::bind(bind_addr)
                .await
                .context("Failed to bind UDP socket")?;

            socket
                .connect(SocketAddr::new(ip, packet.port))
                .await
                .with_context(|| {
                    format!("Failed to connect UDP to {}:{}", packet.host, packet.port)
                })?;

            Ok(ClientStream::Udp(socket))
        }
        StreamType::Other(_) => anyhow::bail!("Unsupported stream type"),
    }
}

/// Forward data between a MuxStream and a TCP stream
pub async fn forward_tcp<W>(mux: MuxStream<W>, mut tcp: TcpStream, buffer_size: usize) -> Result<()>
where
    W: WebSocketWrite,
{
    let closer = mux.get_close_handle();

    let result: Result<()> = async {
        let (mut mux_read, mux_write) = mux.into_split();
        let (mut tcp_read, mut tcp_write) = tcp.split();

        let mut tcp_buf = vec![0u8; buffer_size];

        loop {
            select! {
                // MuxStream -> TCP
                data = mux_read.read() => {
                    match data {
                        Some(data) => {
                            tcp_write.write_all(&data).await?;
                        }
                        None => break,
                    }
                }
                // TCP -> MuxStream
                result = tcp_read.read(&mut tcp_buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            mux_write.write(Bytes::copy_from_slice(&tcp_buf[..n])).await
                                .map_err(|e| anyhow::anyhow!("MuxStream write error: {:?}", e))?;
                        }
                        Err(e) => {
                            trace!("TCP read error: {:?}", e);
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            let _ = closer.close(CloseReason::Voluntary).await;
        }
        Err(_) => {
            let _ = closer.close(CloseReason::Unexpected).await;
        }
    }

    Ok(())
}

/// Forward data between a MuxStream and a UDP socket
pub async fn forward_udp<W>(mux: MuxStream<W>, socket: UdpSocket) -> Result<()>
where
    W: WebSocketWrite,
{
    let closer = mux.get_close_handle();
    let (mut mux_read, mux_write) = mux.into_split();

    let result: Result<()> = async {
        let mut udp_buf = vec![0u8; 65507]; // Max UDP packet size

        loop {
            select! {
                // MuxStream -> UDP
                data = mux_read.read() => {
                    match data {
                        Some(data) => {
                            socket.send(&data).await?;
                        }
                        None => break,
                    }
                }
                // UDP -> MuxStream
                result = socket.recv(&mut udp_buf) => {
                    match result {
                        Ok(n) => {
                            mux_write.write(Bytes::copy_from_slice(&udp_buf[..n])).await
                                .map_err(|e| anyhow::anyhow!("MuxStream write error: {:?}", e))?;
                        }
                        Err(e) => {
                            trace!("UDP recv error: {:?}", e);
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            let _ = closer.close(CloseReason::Voluntary).await;
        }
        Err(_) => {
            let _ = closer.close(CloseReason::Unexpected).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_reason_mapping() {
        let refused: anyhow::Error = std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )
        .into();
        assert_eq!(
            connect_error_reason(&refused),
            CloseReason::ServerStreamConnectionRefused
        );

        let timed_out: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out").into();
        assert_eq!(
            connect_error_reason(&timed_out),
            CloseReason::ServerStreamConnectionTimedOut
        );

        // Context wrapping keeps the underlying kind reachable.
        let wrapped = refused.context("Failed to connect to example.com:80");
        assert_eq!(
            connect_error_reason(&wrapped),
            CloseReason::ServerStreamConnectionRefused
        );

        let other = anyhow::anyhow!("something else");
        assert_eq!(connect_error_reason(&other), CloseReason::Unexpected);
    }
}
