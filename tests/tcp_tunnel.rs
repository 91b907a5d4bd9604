use std::{sync::Arc, time::Duration};

use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use russh::{
    Channel, ChannelMsg,
    client::{self, Msg, Session},
    keys::{key::PrivateKeyWithHashAlg, load_secret_key},
};
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    time::{sleep, timeout},
};

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn tcp_tunnel_round_trip() {
    // 1. Initialize burrow
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--domain=foobar.tld",
        "--listen-address=127.0.0.1",
        "--ssh-port=28122",
        "--host-key-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_key"),
        "--authorized-keys-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/authorized_keys"),
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:28122").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for burrow to start.")
    };

    // 2. Start the SSH client that will be proxied
    let key = load_secret_key(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/client_key"),
        None,
    )
    .expect("Missing file client_key");
    let ssh_client = SshClient;
    let mut session = client::connect(Default::default(), "127.0.0.1:28122", ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_publickey(
                "user",
                PrivateKeyWithHashAlg::new(
                    Arc::new(key),
                    session.best_supported_rsa_hash().await.unwrap().flatten()
                )
            )
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );
    let mut channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel
        .exec(true, "id=tcp-client,type=tcp")
        .await
        .expect("exec failed");
    sleep(Duration::from_millis(500)).await;
    let port = session
        .tcpip_forward("127.0.0.1", 28990)
        .await
        .expect("tcpip_forward failed");
    assert_eq!(port, 28990);
    let lines = read_channel_lines(&mut channel, 1).await;
    assert_eq!(lines[0], "foobar.tld:28990");

    // 3. Connect to the TCP port of our proxy
    let mut tcp_stream = TcpStream::connect("127.0.0.1:28990")
        .await
        .expect("TCP connection failed");
    let mut buf = String::with_capacity(32);
    tcp_stream.read_to_string(&mut buf).await.unwrap();
    assert_eq!(buf, "Hello from a burrow tunnel!");

    // 4. The session channel must be notified of the connection
    let lines = read_channel_lines(&mut channel, 1).await;
    assert!(
        lines[0].starts_with("Received tcp request from "),
        "{lines:?}"
    );
}

async fn read_channel_lines(channel: &mut Channel<Msg>, wanted: usize) -> Vec<String> {
    let mut bytes = Vec::new();
    timeout(Duration::from_secs(5), async {
        while bytes.iter().filter(|byte| **byte == b'\n').count() < wanted {
            match channel.wait().await.expect("channel closed") {
                ChannelMsg::Data { data } => bytes.extend_from_slice(&data),
                _ => (),
            }
        }
    })
    .await
    .expect("Timeout waiting for session messages");
    String::from_utf8_lossy(&bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

struct SshClient;

impl client::Handler for SshClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tokio::spawn(async move {
            channel
                .data(&b"Hello from a burrow tunnel!"[..])
                .await
                .unwrap();
            channel.eof().await.unwrap();
        });
        Ok(())
    }
}
