// wifi.rs

use std::net::Ipv4Addr;

use log::*;
use thiserror::Error;
use tokio::time::sleep;

use crate::*;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("not associated yet")]
    NotAssociated,
    #[error("wifi driver error: {0}")]
    Driver(String),
    #[error("invalid wifi configuration: {0}")]
    Config(&'static str),
    #[error("gave up after {0} association attempts")]
    GaveUp(u32),
}

/// The station-mode radio.
#[allow(async_fn_in_trait)]
pub trait NetworkLink {
    /// Load credentials and start the driver. Called once.
    async fn start(&mut self) -> Result<(), NetworkError>;

    /// One association attempt; resolves with the DHCP address.
    async fn associate(&mut self) -> Result<Ipv4Addr, NetworkError>;

    fn hardware_address(&self) -> Result<[u8; 6], NetworkError>;
}

/// Brings the link up and does not come back until it has an address,
/// unless the retry policy is bounded.
pub async fn bring_up<L: NetworkLink>(
    link: &mut L,
    config: &StationConfig,
) -> Result<Ipv4Addr, NetworkError> {
    info!("Connecting to {}", config.wifi_ssid);
    link.start().await?;

    let policy = config.wifi_retry;
    let mut failures = 0;
    loop {
        match link.associate().await {
            Ok(ip) => {
                info!("WiFi connected - ESP IP address: {ip}");
                return Ok(ip);
            }
            Err(e) => {
                failures += 1;
                debug!("WiFi waiting for association ({failures}): {e}");
                if failures % 10 == 0 {
                    info!("WiFi still connecting, {failures} attempts so far");
                }
                if policy.exhausted(failures) {
                    return Err(NetworkError::GaveUp(failures));
                }
                sleep(policy.backoff).await;
            }
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspNetwork;

#[cfg(target_os = "espidf")]
mod esp {
    use std::net::Ipv4Addr;

    use embedded_svc::wifi::{ClientConfiguration, Configuration};
    use esp_idf_hal::modem::Modem;
    use esp_idf_svc::{
        eventloop::EspSystemEventLoop,
        nvs::EspDefaultNvsPartition,
        timer::EspTaskTimerService,
        wifi::{AsyncWifi, EspWifi},
    };
    use log::*;

    use super::{NetworkError, NetworkLink};
    use crate::StationConfig;

    fn driver_err(e: impl core::fmt::Debug) -> NetworkError {
        NetworkError::Driver(format!("{e:?}"))
    }

    pub struct EspNetwork {
        wifi: AsyncWifi<EspWifi<'static>>,
        ssid: String,
        pass: String,
    }

    impl EspNetwork {
        pub fn new(
            modem: Modem,
            sysloop: EspSystemEventLoop,
            timer: EspTaskTimerService,
            nvs: EspDefaultNvsPartition,
            config: &StationConfig,
        ) -> Result<Self, NetworkError> {
            info!("Initializing Wi-Fi...");
            let espwifi = EspWifi::new(modem, sysloop.clone(), Some(nvs)).map_err(driver_err)?;
            let wifi = AsyncWifi::wrap(espwifi, sysloop, timer).map_err(driver_err)?;
            Ok(Self {
                wifi,
                ssid: config.wifi_ssid.clone(),
                pass: config.wifi_pass.clone(),
            })
        }
    }

    impl NetworkLink for EspNetwork {
        async fn start(&mut self) -> Result<(), NetworkError> {
            info!("WiFi setting credentials...");
            self.wifi
                .set_configuration(&Configuration::Client(ClientConfiguration {
                    ssid: self
                        .ssid
                        .as_str()
                        .try_into()
                        .map_err(|_| NetworkError::Config("ssid too long"))?,
                    password: self
                        .pass
                        .as_str()
                        .try_into()
                        .map_err(|_| NetworkError::Config("passphrase too long"))?,
                    ..Default::default()
                }))
                .map_err(driver_err)?;

            info!("WiFi driver starting...");
            Box::pin(self.wifi.start()).await.map_err(driver_err)
        }

        async fn associate(&mut self) -> Result<Ipv4Addr, NetworkError> {
            if !self.wifi.is_connected().map_err(driver_err)? {
                info!("WiFi connecting...");
                Box::pin(self.wifi.connect()).await.map_err(driver_err)?;
            }

            info!("WiFi waiting for address...");
            Box::pin(self.wifi.wait_netif_up()).await.map_err(driver_err)?;

            let ip_info = self.wifi.wifi().sta_netif().get_ip_info().map_err(driver_err)?;
            Ok(ip_info.ip)
        }

        fn hardware_address(&self) -> Result<[u8; 6], NetworkError> {
            self.wifi.wifi().sta_netif().get_mac().map_err(driver_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::testing::MockLink;

    const MAC: [u8; 6] = [0x24, 0x0a, 0xc4, 0x00, 0x00, 0x01];
    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);

    #[tokio::test(start_paused = true)]
    async fn returns_address_once_associated() {
        let config = StationConfig::default();
        let mut link = MockLink::new(MAC, IP).failing(4);

        let t0 = Instant::now();
        assert_eq!(bring_up(&mut link, &config).await, Ok(IP));
        let waited = t0.elapsed();
        assert!(waited >= Duration::from_millis(4 * 500));
        assert!(waited < Duration::from_millis(5 * 500));
        assert!(link.log().started);
        assert_eq!(link.log().attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_while_never_associated() {
        let config = StationConfig::default();
        let mut link = MockLink::new(MAC, IP).failing(u32::MAX);

        let res =
            tokio::time::timeout(Duration::from_secs(3600), bring_up(&mut link, &config)).await;
        assert!(res.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_gives_up() {
        let config = StationConfig {
            wifi_retry: RetryPolicy::bounded(Duration::from_millis(500), 2),
            ..Default::default()
        };
        let mut link = MockLink::new(MAC, IP).failing(u32::MAX);
        assert_eq!(
            bring_up(&mut link, &config).await,
            Err(NetworkError::GaveUp(2))
        );
    }
}

// EOF
