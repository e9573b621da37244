use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::Traffic;

pub const DEFAULT_TCP_BUFFER_SIZE: usize = 32 * 1024;

/// Bidirectional byte-stream splice for passthrough TCP.
///
/// Each direction copies through its own fixed-size buffer. The splice ends
/// as soon as either direction reaches EOF or errors; both write sides are
/// then shut down. Returns the bytes moved each way: `sent` is
/// upstream→downstream, `received` the reverse.
pub async fn splice<A, B>(upstream: A, downstream: B, buffer_size: usize) -> Traffic
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let buffer_size = if buffer_size == 0 {
        DEFAULT_TCP_BUFFER_SIZE
    } else {
        buffer_size
    };

    let (mut up_rd, mut up_wr) = tokio::io::split(upstream);
    let (mut down_rd, mut down_wr) = tokio::io::split(downstream);

    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);

    {
        let a = copy_half(&mut up_rd, &mut down_wr, buffer_size, &sent);
        let b = copy_half(&mut down_rd, &mut up_wr, buffer_size, &received);
        tokio::pin!(a);
        tokio::pin!(b);
        tokio::select! {
            _ = &mut a => {}
            _ = &mut b => {}
        }
    }

    let _ = up_wr.shutdown().await;
    let _ = down_wr.shutdown().await;

    Traffic {
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
    }
}

async fn copy_half<R, W>(rd: &mut R, wr: &mut W, buffer_size: usize, moved: &AtomicU64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        if wr.write_all(&buf[..n]).await.is_err() {
            return;
        }
        if wr.flush().await.is_err() {
            return;
        }
        moved.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splice_moves_bytes_and_counts_each_way() {
        let (client, client_far) = tokio::io::duplex(4096);
        let (server, server_far) = tokio::io::duplex(4096);

        let task = tokio::spawn(splice(client_far, server_far, 1024));

        let (mut crd, mut cwr) = tokio::io::split(client);
        let (mut srd, mut swr) = tokio::io::split(server);

        cwr.write_all(b"hello downstream").await.unwrap();
        let mut got = vec![0u8; 16];
        srd.read_exact(&mut got).await.unwrap();
        assert_eq!(got, b"hello downstream");

        swr.write_all(b"and back").await.unwrap();
        swr.shutdown().await.unwrap();

        let mut got = Vec::new();
        crd.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"and back");

        let traffic = task.await.unwrap();
        assert_eq!(traffic.sent, 16);
        assert_eq!(traffic.received, 8);
    }

    #[tokio::test]
    async fn splice_ends_when_one_side_closes() {
        let (client, client_far) = tokio::io::duplex(4096);
        let (_server, server_far) = tokio::io::duplex(4096);

        let task = tokio::spawn(splice(client_far, server_far, 1024));
        drop(client);

        let traffic = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("splice must end on single-sided close")
            .unwrap();
        assert_eq!(traffic.sent, 0);
    }
}
