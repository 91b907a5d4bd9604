use std::{sync::Arc, time::Duration};

use burrow::{ApplicationConfig, entrypoint};
use clap::Parser;
use russh::{
    Channel, ChannelMsg,
    client::{self, Msg},
    keys::{key::PrivateKeyWithHashAlg, load_secret_key},
};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

// Two clients requesting the same tunnel name: the second one must be told
// the name is taken and receive a generated one instead.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn second_client_cannot_take_an_owned_name() {
    // 1. Initialize burrow
    let config = ApplicationConfig::parse_from([
        "burrow",
        "--domain=foobar.tld",
        "--listen-address=127.0.0.1",
        "--ssh-port=28222",
        "--host-key-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_key"),
        "--authorized-keys-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/authorized_keys"),
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:28222").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for burrow to start.")
    };

    // 2. First client claims the name
    let (_first_session, mut first_channel) =
        open_tunnel("id=client-a,tunnelname=shared,type=http").await;
    let lines = read_channel_lines(&mut first_channel, 1).await;
    assert_eq!(lines[0], "https://shared.foobar.tld");

    // 3. Second client is denied the name and gets a generated one
    let (_second_session, mut second_channel) =
        open_tunnel("id=client-b,tunnelname=shared,type=http").await;
    let lines = read_channel_lines(&mut second_channel, 2).await;
    assert_eq!(lines[0], "Specified subdomain 'shared' already taken");
    let address = lines[1]
        .strip_prefix("https://")
        .and_then(|rest| rest.strip_suffix(".foobar.tld"))
        .unwrap_or_else(|| panic!("unexpected address line {:?}", lines[1]));
    assert_ne!(address, "shared");
    assert_eq!(address.len(), 4);
    assert!(
        address
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit()),
        "{address}"
    );
}

async fn open_tunnel(command: &str) -> (client::Handle<SshClient>, Channel<Msg>) {
    let key = load_secret_key(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/client_key"),
        None,
    )
    .expect("Missing file client_key");
    let mut session = client::connect(Default::default(), "127.0.0.1:28222", SshClient)
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
    let channel = session
        .channel_open_session()
        .await
        .expect("channel_open_session failed");
    channel.exec(true, command).await.expect("exec failed");
    sleep(Duration::from_millis(500)).await;
    session
        .tcpip_forward("127.0.0.1", 28281)
        .await
        .expect("tcpip_forward failed");
    // The session handle must stay alive for the name to remain owned.
    (session, channel)
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
}
