use std::time::Duration;
use anyhow::bail;

use crate::assets::XFER_FIRST_PACKET_LEN;

pub struct NetworkConfig {
    /// Period of the liveness timer. A current circuit that stays silent for two consecutive periods
    ///  is considered dead, and the session is shut down with `NetworkTimeout`.
    pub simulator_timeout: Duration,
    /// Upper bound for waiting on a simulator's region handshake while connecting. Expiry is
    ///  logged but does not fail the connection.
    pub connect_timeout: Duration,
    pub logout_timeout: Duration,

    /// Inbound and outbound worker loops wake up at least this often to notice that the session
    ///  was shut down
    pub queue_poll_interval: Duration,
    /// Minimum spacing between two packets leaving the outbound queue - a crude rate governor
    pub outbound_packet_spacing: Duration,
    /// Capacity of each of the inbound and outbound packet queues
    pub packet_inbox_size: usize,

    pub max_packet_size: usize,

    /// dispatch inbound packets on the inbound worker loop itself rather than on spawned tasks
    pub sync_packet_callbacks: bool,
    /// connect to neighbouring simulators when the server announces them
    pub multiple_sims: bool,
    pub send_agent_updates: bool,

    pub transfer_header_timeout: Duration,
    pub xfer_header_timeout: Duration,
    /// How long an upload waits for the previous upload to be picked up by the server
    pub upload_confirm_timeout: Duration,
    /// Largest asset size a download may announce. Larger announcements fail the download
    ///  before any buffer is allocated.
    pub max_asset_size: usize,

    pub event_channel_capacity: usize,
}

impl NetworkConfig {
    pub fn new() -> NetworkConfig {
        NetworkConfig {
            simulator_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(60),
            logout_timeout: Duration::from_secs(5),
            queue_poll_interval: Duration::from_millis(100),
            outbound_packet_spacing: Duration::from_millis(10),
            packet_inbox_size: 100,
            max_packet_size: 1200,
            sync_packet_callbacks: false,
            multiple_sims: true,
            send_agent_updates: true,
            transfer_header_timeout: Duration::from_secs(15),
            xfer_header_timeout: Duration::from_secs(15),
            upload_confirm_timeout: Duration::from_secs(20),
            max_asset_size: 64 * 1024 * 1024,
            event_channel_capacity: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let durations = [
            ("simulator timeout", self.simulator_timeout),
            ("connect timeout", self.connect_timeout),
            ("logout timeout", self.logout_timeout),
            ("queue poll interval", self.queue_poll_interval),
            ("transfer header timeout", self.transfer_header_timeout),
            ("xfer header timeout", self.xfer_header_timeout),
            ("upload confirm timeout", self.upload_confirm_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                bail!("{} must not be zero", name);
            }
        }

        if self.max_packet_size <= XFER_FIRST_PACKET_LEN {
            bail!("max packet size {} can not hold an Xfer data packet", self.max_packet_size);
        }
        if self.packet_inbox_size == 0 {
            bail!("packet queues need a capacity of at least one");
        }
        if self.max_asset_size == 0 {
            bail!("max asset size must not be zero");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must not be zero");
        }

        Ok(())
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig::new()
    }
}
