// Cloud portal HTTP client
//
// Wraps `reqwest::Client` with cookie-session login, form-encoded POSTs and
// `{ success, msg }` envelope unwrapping. One client (and one session) is
// shared by every cloud binding in the process; endpoint methods are thin
// wrappers over `post_form`.

use std::sync::atomic::{AtomicBool, Ordering};

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::cloud::http::HttpConfig;
use crate::cloud::models::{
    CloudBatteryInfo, CloudEnergy, CloudInverterInfo, CloudMidbox, CloudQuickCharge,
    CloudRemoteRead, CloudRuntime, Envelope,
};
use crate::error::Error;
use crate::models::{
    FirmwareInfo, RawBatteryBank, RawControllerEnergy, RawControllerRuntime, RawEnergy,
    RawParameters, RawRuntime,
};
use crate::transport::RegisterRange;

const LOGIN: &str = "WManage/api/login";
const INVERTER_RUNTIME: &str = "WManage/api/inverter/getInverterRuntime";
const INVERTER_ENERGY: &str = "WManage/api/inverter/getInverterEnergyInfo";
const INVERTER_INFO: &str = "WManage/api/inverter/getInverterInfo";
const BATTERY_INFO: &str = "WManage/api/battery/getBatteryInfo";
const MIDBOX_RUNTIME: &str = "WManage/api/midbox/getMidboxRuntime";
const REMOTE_READ: &str = "WManage/web/maintain/remoteRead/read";
const REMOTE_WRITE: &str = "WManage/web/maintain/remoteSet/write";
const QUICK_CHARGE_STATUS: &str = "WManage/web/config/quickCharge/getStatusInfo";

/// Largest register block the portal relays in one remote read.
pub const MAX_REMOTE_READ: u16 = 127;

/// Raw HTTP client for the inverter cloud portal.
pub struct CloudClient {
    http: reqwest::Client,
    base_url: Url,
    account: String,
    password: SecretString,
    logged_in: AtomicBool,
    login_lock: Mutex<()>,
}

impl CloudClient {
    /// Create a new client. A cookie jar is added if the config has none;
    /// the session lives in it.
    pub fn new(
        base_url: Url,
        account: impl Into<String>,
        password: SecretString,
        http: &HttpConfig,
    ) -> Result<Self, Error> {
        let config = if http.cookie_jar.is_some() {
            http.clone()
        } else {
            http.clone().with_cookie_jar()
        };
        let mut base_url = base_url;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: config.build_client()?,
            base_url,
            account: account.into(),
            password,
            logged_in: AtomicBool::new(false),
            login_lock: Mutex::new(()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    /// Forget the current session; the next `ensure_session` logs in again.
    pub fn invalidate_session(&self) {
        self.logged_in.store(false, Ordering::Release);
    }

    /// Log in unless a session is already established.
    ///
    /// Concurrent callers wait on one login instead of each posting
    /// credentials.
    pub async fn ensure_session(&self) -> Result<(), Error> {
        if self.is_logged_in() {
            return Ok(());
        }
        let _guard = self.login_lock.lock().await;
        if self.is_logged_in() {
            return Ok(());
        }
        self.login().await
    }

    /// Authenticate with account and password.
    ///
    /// `POST /WManage/api/login`
    pub async fn login(&self) -> Result<(), Error> {
        let url = self.base_url.join(LOGIN)?;
        debug!("logging in at {}", url);

        let resp = self
            .http
            .post(url)
            .form(&[
                ("account", self.account.as_str()),
                ("password", self.password.expose_secret()),
            ])
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: format!("login failed (HTTP {status}): {body}"),
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;
        let envelope: Envelope = serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: body.clone(),
        })?;
        if !envelope.success {
            return Err(Error::Authentication {
                message: envelope.msg.unwrap_or_else(|| "login rejected".into()),
            });
        }

        self.logged_in.store(true, Ordering::Release);
        info!(account = %self.account, "cloud session established");
        Ok(())
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// POST a form and unwrap the `{ success, msg }` envelope.
    pub(crate) async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, Error> {
        let url = self.base_url.join(path)?;
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(Error::Transport)?;

        self.parse_envelope(resp).await
    }

    async fn parse_envelope<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T, Error> {
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            self.invalidate_session();
            return Err(Error::SessionExpired);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(Error::RateLimited { retry_after_secs });
        }

        let body = resp.text().await.map_err(Error::Transport)?;

        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: body.clone(),
            })?;
        let envelope: Envelope =
            serde_json::from_value(value.clone()).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: body.clone(),
            })?;

        if !envelope.success {
            let message = envelope.msg.unwrap_or_else(|| "request rejected".into());
            if message.eq_ignore_ascii_case("needLogin") {
                warn!("cloud session rejected by portal");
                self.invalidate_session();
                return Err(Error::SessionExpired);
            }
            return Err(Error::CloudApi { message });
        }

        serde_json::from_value(value).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }

    // ── Endpoints ────────────────────────────────────────────────────

    /// `POST /WManage/api/inverter/getInverterRuntime`
    pub async fn inverter_runtime(&self, serial: &str) -> Result<RawRuntime, Error> {
        let raw: CloudRuntime = self
            .post_form(INVERTER_RUNTIME, &[("serialNum", serial)])
            .await?;
        Ok(raw.into())
    }

    /// `POST /WManage/api/inverter/getInverterEnergyInfo`
    pub async fn inverter_energy(&self, serial: &str) -> Result<RawEnergy, Error> {
        let raw: CloudEnergy = self
            .post_form(INVERTER_ENERGY, &[("serialNum", serial)])
            .await?;
        Ok(raw.into())
    }

    /// `POST /WManage/api/inverter/getInverterInfo`
    pub async fn inverter_info(&self, serial: &str) -> Result<FirmwareInfo, Error> {
        let raw: CloudInverterInfo = self
            .post_form(INVERTER_INFO, &[("serialNum", serial)])
            .await?;
        raw.into_firmware()
    }

    /// `POST /WManage/api/battery/getBatteryInfo`
    pub async fn battery_info(&self, serial: &str) -> Result<RawBatteryBank, Error> {
        let raw: CloudBatteryInfo = self
            .post_form(BATTERY_INFO, &[("serialNum", serial)])
            .await?;
        Ok(raw.into())
    }

    /// `POST /WManage/api/midbox/getMidboxRuntime`
    pub async fn midbox_runtime(
        &self,
        serial: &str,
    ) -> Result<(RawControllerRuntime, RawControllerEnergy), Error> {
        let raw: CloudMidbox = self
            .post_form(MIDBOX_RUNTIME, &[("serialNum", serial)])
            .await?;
        Ok((raw.runtime(), raw.energy()))
    }

    /// Relay a holding-register read through the portal.
    ///
    /// `POST /WManage/web/maintain/remoteRead/read`
    pub async fn remote_read(
        &self,
        serial: &str,
        range: RegisterRange,
    ) -> Result<RawParameters, Error> {
        let mut out = RawParameters::new();
        for chunk in range.chunks(MAX_REMOTE_READ) {
            let start = chunk.start.to_string();
            let count = chunk.count.to_string();
            let raw: CloudRemoteRead = self
                .post_form(
                    REMOTE_READ,
                    &[
                        ("inverterSn", serial),
                        ("startRegister", &start),
                        ("pointNumber", &count),
                    ],
                )
                .await?;
            out.extend(raw.into_parameters(chunk.start)?);
        }
        Ok(out)
    }

    /// Relay a single holding-register write through the portal.
    ///
    /// `POST /WManage/web/maintain/remoteSet/write`
    pub async fn remote_write(&self, serial: &str, register: u16, value: u16) -> Result<(), Error> {
        info!(serial, register, value, "writing holding register via cloud");
        let register = register.to_string();
        let value = value.to_string();
        let _: serde_json::Value = self
            .post_form(
                REMOTE_WRITE,
                &[
                    ("inverterSn", serial),
                    ("startRegister", &register),
                    ("valueText", &value),
                ],
            )
            .await?;
        Ok(())
    }

    /// Whether a quick-charge task is currently open.
    ///
    /// `POST /WManage/web/config/quickCharge/getStatusInfo`
    pub async fn quick_charge_status(&self, serial: &str) -> Result<bool, Error> {
        let raw: CloudQuickCharge = self
            .post_form(QUICK_CHARGE_STATUS, &[("inverterSn", serial)])
            .await?;
        Ok(raw.has_unclosed_quick_charge_task)
    }
}
