//! One-shot certificate transfer with a one-time password.
//!
//! `share_certificate` opens a short-lived TCP listener; the receiving
//! daemon connects, sends the OTP terminated by a newline, and gets the
//! PEM bytes back. One wrong or missing OTP closes the connection with
//! nothing sent; the listener dies after one attempt or the timeout.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long the share listener waits for the peer.
const SHARE_WINDOW: Duration = Duration::from_secs(120);

/// Six decimal digits, spoken over the phone or typed across the desk.
pub fn generate_otp() -> String {
    let mut rng = rand::rng();
    format!("{:06}", rng.random_range(0..1_000_000u32))
}

/// Serve `cert_path` once to a peer presenting `otp`.
///
/// Returns the bound port and the serving task.
pub async fn share(cert_path: PathBuf, otp: String) -> Result<(u16, JoinHandle<()>)> {
    let pem = std::fs::read(&cert_path)
        .with_context(|| format!("Failed to read certificate {}", cert_path.display()))?;
    let listener = TcpListener::bind("0.0.0.0:0")
        .await
        .context("Failed to bind certificate share listener")?;
    let port = listener.local_addr()?.port();
    log::info!("[CertShare] Serving certificate on port {port}");

    let task = tokio::spawn(async move {
        let served = timeout(SHARE_WINDOW, async {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return false;
                };
                log::info!("[CertShare] Transfer attempt from {peer}");
                if serve_once(stream, &otp, &pem).await {
                    return true;
                }
                // Wrong OTP: keep listening until the window closes.
            }
        })
        .await;

        match served {
            Ok(true) => log::info!("[CertShare] Certificate delivered"),
            Ok(false) => log::warn!("[CertShare] Share listener failed"),
            Err(_) => log::warn!("[CertShare] Share window expired"),
        }
    });

    Ok((port, task))
}

async fn serve_once(mut stream: TcpStream, otp: &str, pem: &[u8]) -> bool {
    let mut buf = [0u8; 64];
    let mut received = Vec::new();

    let read = timeout(Duration::from_secs(10), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => return false,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    if received.contains(&b'\n') || received.len() >= 64 {
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    if !read {
        return false;
    }

    let presented = String::from_utf8_lossy(&received);
    if presented.trim() != otp {
        log::warn!("[CertShare] Rejected transfer: wrong OTP");
        return false;
    }

    if stream.write_all(pem).await.is_err() {
        return false;
    }
    let _ = stream.shutdown().await;
    true
}

/// Fetch a shared certificate from `host:port` using `otp`.
pub async fn receive(host: &str, port: u16, otp: &str) -> Result<Vec<u8>> {
    let mut stream = timeout(Duration::from_secs(10), TcpStream::connect((host, port)))
        .await
        .context("Certificate transfer timed out")?
        .with_context(|| format!("Failed to connect to {host}:{port}"))?;

    stream.write_all(format!("{otp}\n").as_bytes()).await?;

    let mut pem = Vec::new();
    timeout(Duration::from_secs(30), stream.read_to_end(&mut pem))
        .await
        .context("Certificate transfer timed out")??;

    if pem.is_empty() {
        bail!("Peer sent no certificate (wrong OTP?)");
    }
    if !pem.starts_with(b"-----BEGIN") {
        bail!("Peer sent something that is not a PEM certificate");
    }
    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_otp_is_six_digits() {
        for _ in 0..20 {
            let otp = generate_otp();
            assert_eq!(otp.len(), 6);
            assert!(otp.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_share_and_receive_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cert = tmp.path().join("cert.pem");
        std::fs::write(&cert, b"-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n")
            .unwrap();

        let (port, task) = share(cert.clone(), "123456".into()).await.unwrap();
        let pem = receive("127.0.0.1", port, "123456").await.unwrap();
        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_otp_gets_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cert = tmp.path().join("cert.pem");
        std::fs::write(&cert, b"-----BEGIN CERTIFICATE-----\nxyz\n-----END CERTIFICATE-----\n")
            .unwrap();

        let (port, task) = share(cert.clone(), "123456".into()).await.unwrap();
        let result = receive("127.0.0.1", port, "000000").await;
        assert!(result.is_err());
        task.abort();
    }
}
