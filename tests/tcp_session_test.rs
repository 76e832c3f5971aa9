//! End-to-end tests over real TCP sockets on ephemeral ports.

use scpi_emulator::config::{InstrumentDefinition, ServerConfig};
use scpi_emulator::network::ServerManager;
use scpi_emulator::scpi::EngineSettings;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(2);

fn psu() -> InstrumentDefinition {
    InstrumentDefinition::new("Test PSU")
        .with_command("VOLT (.+)", "OK", "range:0,30")
        .with_command("VOLT?", "0.0", "")
        .with_command("OUTP (.+)", "", "bool")
        .with_command("OUTP?", "0", "")
}

fn dmm() -> InstrumentDefinition {
    InstrumentDefinition::new("Test DMM")
        .with_command("MEAS:VOLT:DC?", "1.234567E+00", "")
        .with_command("VOLT (.+)", "OK", "range:0,10")
        .with_command("VOLT?", "5.0", "")
}

fn server_config() -> ServerConfig {
    ServerConfig {
        port_start: 0,
        ..Default::default()
    }
}

async fn manager_with(server: ServerConfig, defs: Vec<InstrumentDefinition>) -> ServerManager {
    let manager = ServerManager::new(server, EngineSettings::default());
    manager.load(defs).await.unwrap();
    manager.start_all().await.unwrap();
    manager
}

/// A line-oriented SCPI client.
struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(IO_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a response")
            .unwrap();
        line
    }

    /// Sends a query and returns the response without its terminator.
    async fn query(&mut self, line: &str) -> String {
        self.send(line).await;
        let response = self.read_line().await;
        assert!(response.ends_with('\n'), "unterminated response {response:?}");
        response.trim_end_matches('\n').to_string()
    }

    /// Asserts nothing arrives within a short window.
    async fn expect_silence(&mut self) {
        let mut buf = [0u8; 64];
        let read = timeout(Duration::from_millis(150), self.reader.read(&mut buf)).await;
        assert!(read.is_err(), "unexpected data: {read:?}");
    }
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let manager = manager_with(server_config(), vec![psu()]).await;
    let addr = manager.local_addr("test_psu").await.unwrap();
    let mut client = Client::connect(addr).await;

    assert_eq!(client.query("VOLT 10").await, "OK");
    assert_eq!(client.query("VOLT?").await, "10");

    client.send("VOLT 99").await;
    assert_eq!(client.query("SYST:ERR?").await, "-222,\"Data out of range;99\"");
    assert_eq!(client.query("SYST:ERR?").await, "0,\"No error\"");

    client.send("*RST").await;
    assert_eq!(client.query("VOLT?").await, "0.0");

    // Validation survives the reset.
    client.send("VOLT 99").await;
    assert_eq!(client.query("SYST:ERR?").await, "-222,\"Data out of range;99\"");

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_no_banner_and_silent_set() {
    let manager = manager_with(server_config(), vec![psu()]).await;
    let addr = manager.local_addr("test_psu").await.unwrap();
    let mut client = Client::connect(addr).await;

    client.expect_silence().await;

    // Empty configured response and failed sets produce no bytes at all.
    client.send("OUTP ON").await;
    client.send("VOLT -1").await;
    client.send("FOO:BAR").await;
    client.expect_silence().await;

    assert_eq!(client.query("OUTP?").await, "1");
    assert_eq!(client.query("*STB?").await, "4");

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_device_clear_on_new_connection() {
    let manager = manager_with(server_config(), vec![psu()]).await;
    let addr = manager.local_addr("test_psu").await.unwrap();

    let mut first = Client::connect(addr).await;
    assert_eq!(first.query("VOLT 12").await, "OK");
    assert_eq!(first.query("VOLT?").await, "12");

    // Opening a second session simulates the VISA device clear.
    let mut second = Client::connect(addr).await;
    assert_eq!(second.query("VOLT?").await, "0.0");

    // Validation is still in force after the clear.
    second.send("VOLT 31").await;
    assert_eq!(second.query("SYST:ERR?").await, "-222,\"Data out of range;31\"");

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_state_kept_across_connections_when_clear_disabled() {
    let server = ServerConfig {
        device_clear_on_connect: false,
        ..server_config()
    };
    let manager = manager_with(server, vec![psu()]).await;
    let addr = manager.local_addr("test_psu").await.unwrap();

    let mut first = Client::connect(addr).await;
    assert_eq!(first.query("VOLT 12").await, "OK");
    drop(first);

    let mut second = Client::connect(addr).await;
    assert_eq!(second.query("VOLT?").await, "12");

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_instruments_are_isolated() {
    let manager = manager_with(server_config(), vec![psu(), dmm()]).await;
    let psu_addr = manager.local_addr("test_psu").await.unwrap();
    let dmm_addr = manager.local_addr("test_dmm").await.unwrap();
    assert_ne!(psu_addr.port(), dmm_addr.port());

    let mut psu = Client::connect(psu_addr).await;
    let mut dmm = Client::connect(dmm_addr).await;

    assert_eq!(psu.query("VOLT 20").await, "OK");
    // 20 is outside the DMM's own range.
    dmm.send("VOLT 20").await;

    assert_eq!(psu.query("VOLT?").await, "20");
    assert_eq!(dmm.query("VOLT?").await, "5.0");
    assert_eq!(psu.query("SYST:ERR?").await, "0,\"No error\"");
    assert_eq!(dmm.query("SYST:ERR?").await, "-222,\"Data out of range;20\"");
    assert_eq!(dmm.query("MEAS:VOLT:DC?").await, "1.234567E+00");

    let idn = psu.query("*IDN?").await;
    assert!(idn.starts_with("SCPI_Emulator,Test PSU,test_psu,"), "{idn}");

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_compound_line_and_terminators() {
    let manager = manager_with(server_config(), vec![psu()]).await;
    let addr = manager.local_addr("test_psu").await.unwrap();
    let mut client = Client::connect(addr).await;

    assert_eq!(client.query("VOLT 3;VOLT?;*OPC?").await, "OK;3;1");

    client.writer.write_all(b"VOLT?\r\n*OPC?\r").await.unwrap();
    assert_eq!(client.read_line().await, "3\n");
    assert_eq!(client.read_line().await, "1\n");

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_unterminated_command_is_answered() {
    let server = ServerConfig {
        flush_unterminated_after: Duration::from_millis(50),
        ..server_config()
    };
    let manager = manager_with(server, vec![psu()]).await;
    let addr = manager.local_addr("test_psu").await.unwrap();
    let mut client = Client::connect(addr).await;

    client.writer.write_all(b"*IDN?").await.unwrap();
    let idn = client.read_line().await;
    assert!(idn.starts_with("SCPI_Emulator,Test PSU"), "{idn}");

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_clients_share_one_engine() {
    let server = ServerConfig {
        device_clear_on_connect: false,
        ..server_config()
    };
    let manager = manager_with(server, vec![psu()]).await;
    let addr = manager.local_addr("test_psu").await.unwrap();

    let mut a = Client::connect(addr).await;
    let mut b = Client::connect(addr).await;

    assert_eq!(a.query("VOLT 7").await, "OK");
    assert_eq!(b.query("VOLT?").await, "7");

    let status = manager.status("test_psu").await.unwrap();
    assert_eq!(status.clients, 2);
    assert_eq!(status.command_count, 2);

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_sessions_and_restart_rebinds() {
    let server = ServerConfig {
        device_clear_on_connect: false,
        ..server_config()
    };
    let manager = manager_with(server, vec![psu()]).await;
    let addr = manager.local_addr("test_psu").await.unwrap();
    let mut client = Client::connect(addr).await;
    assert_eq!(client.query("VOLT 4").await, "OK");

    manager.stop_instrument("test_psu").await.unwrap();

    // Server side closed the session.
    let mut buf = [0u8; 8];
    let read = timeout(IO_TIMEOUT, client.reader.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let addr = manager.restart_instrument("test_psu").await.unwrap();
    let mut client = Client::connect(addr).await;
    // State belongs to the instrument, not the listener.
    assert_eq!(client.query("VOLT?").await, "4");

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_control_surface_shares_state_with_clients() {
    let server = ServerConfig {
        device_clear_on_connect: false,
        ..server_config()
    };
    let manager = manager_with(server, vec![psu()]).await;
    let addr = manager.local_addr("test_psu").await.unwrap();
    let mut client = Client::connect(addr).await;

    assert_eq!(manager.send_command("Test PSU", "VOLT 9").await.unwrap(), "OK");
    assert_eq!(client.query("VOLT?").await, "9");

    manager.device_clear("test_psu").await.unwrap();
    assert_eq!(client.query("VOLT?").await, "0.0");

    manager.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_not_blocked_by_client_that_never_reads() {
    // Larger than the kernel socket buffers on both ends.
    let scope = InstrumentDefinition::new("Bulk Scope").with_command(
        "CURV?",
        "5".repeat(16 * 1024 * 1024),
        "",
    );
    let manager = manager_with(server_config(), vec![scope]).await;
    let addr = manager.local_addr("bulk_scope").await.unwrap();
    let mut client = Client::connect(addr).await;
    client.send("CURV?").await;

    timeout(IO_TIMEOUT, async {
        while manager.status("bulk_scope").await.unwrap().command_count == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let stopped = timeout(Duration::from_secs(4), manager.stop_instrument("bulk_scope")).await;
    assert!(matches!(stopped, Ok(Ok(()))), "{stopped:?}");
    assert!(!manager.is_running("bulk_scope").await.unwrap());
    drop(client);
}
