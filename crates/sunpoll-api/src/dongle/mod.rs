// ── WiFi dongle link ──
//
// The datalogger accepts one TCP client at a time and relays translated
// Modbus requests to the inverter it is plugged into (and to any other
// device on the same RS485 bus). Replies are matched on function,
// inverter serial and start register; heartbeats and stale replies are
// skipped.

pub mod codec;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::local::{LocalTransport, RegisterIo, RegisterTable};
use crate::transport::{Endpoint, RegisterRange, TransportKind};

use self::codec::{Reply, Request};

/// A device addressed through a WiFi dongle.
pub type DongleTransport = LocalTransport<DongleConnection>;

/// Dongle TCP port.
pub const DEFAULT_PORT: u16 = 8000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Session {
    stream: TcpStream,
    buf: BytesMut,
}

/// A shared connection to one WiFi datalogger.
pub struct DongleConnection {
    host: String,
    port: u16,
    datalogger: String,
    endpoint: Endpoint,
    session: Mutex<Option<Session>>,
}

impl DongleConnection {
    pub fn new(host: impl Into<String>, port: u16, datalogger: impl Into<String>) -> Arc<Self> {
        let host = host.into();
        Arc::new(Self {
            endpoint: Endpoint::Tcp {
                host: host.clone(),
                port,
            },
            host,
            port,
            datalogger: datalogger.into(),
            session: Mutex::new(None),
        })
    }

    fn connection_error(&self, reason: impl ToString) -> Error {
        Error::Connection {
            endpoint: self.endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Send `request` and wait for its matching reply.
    async fn exchange(&self, session: &mut Session, request: &Request) -> Result<Reply, Error> {
        let frame = codec::encode_request(&self.datalogger, request);
        session
            .stream
            .write_all(&frame)
            .await
            .map_err(|e| self.connection_error(e))?;

        loop {
            while let Some(frame) = codec::decode_frame(&mut session.buf)? {
                if frame.tcp_function != codec::TCP_TRANSLATED {
                    trace!(function = frame.tcp_function, "skipping non-data frame");
                    continue;
                }
                let reply = codec::parse_reply(&frame.data)?;
                if reply.function == request.function
                    && reply.register == request.register
                    && reply.inverter == request.inverter
                {
                    return Ok(reply);
                }
                debug!(
                    register = reply.register,
                    inverter = %reply.inverter,
                    "discarding stale dongle reply"
                );
            }

            let n = session
                .stream
                .read_buf(&mut session.buf)
                .await
                .map_err(|e| self.connection_error(e))?;
            if n == 0 {
                return Err(self.connection_error("dongle closed the connection"));
            }
        }
    }

    async fn request(&self, request: Request, deadline: Duration) -> Result<Reply, Error> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(Error::NotConnected {
                endpoint: self.endpoint.to_string(),
            });
        };

        let result = match timeout(deadline, self.exchange(session, &request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(deadline)),
        };
        if let Err(e) = &result {
            if e.is_connection_lost() || matches!(e, Error::Timeout { .. }) {
                warn!(endpoint = %self.endpoint, error = %e, "dropping dongle session");
                *guard = None;
            }
        }
        result
    }
}

#[async_trait]
impl RegisterIo for DongleConnection {
    /// Serial of the inverter the request is relayed to.
    type Address = String;

    fn kind(&self) -> TransportKind {
        TransportKind::Dongle
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open(&self) -> Result<(), Error> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        info!(endpoint = %self.endpoint, datalogger = %self.datalogger, "connecting to dongle");
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| self.connection_error("timed out while connecting"))?
            .map_err(|e| self.connection_error(e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| self.connection_error(e))?;
        *guard = Some(Session {
            stream,
            buf: BytesMut::with_capacity(512),
        });
        Ok(())
    }

    async fn close(&self) {
        if self.session.lock().await.take().is_some() {
            debug!(endpoint = %self.endpoint, "dongle session closed");
        }
    }

    async fn read(
        &self,
        inverter: &String,
        table: RegisterTable,
        range: RegisterRange,
        deadline: Duration,
    ) -> Result<Vec<u16>, Error> {
        let function = match table {
            RegisterTable::Input => codec::READ_INPUT,
            RegisterTable::Holding => codec::READ_HOLDING,
        };
        let reply = self
            .request(
                Request {
                    function,
                    inverter: inverter.clone(),
                    register: range.start,
                    operand: range.count,
                },
                deadline,
            )
            .await?;
        Ok(reply.values)
    }

    async fn write(
        &self,
        inverter: &String,
        register: u16,
        value: u16,
        deadline: Duration,
    ) -> Result<(), Error> {
        info!(endpoint = %self.endpoint, %inverter, register, value, "writing holding register");
        let reply = self
            .request(
                Request {
                    function: codec::WRITE_SINGLE,
                    inverter: inverter.clone(),
                    register,
                    operand: value,
                },
                deadline,
            )
            .await?;
        if reply.values.first() == Some(&value) {
            Ok(())
        } else {
            Err(Error::read(format!(
                "write of register {register} echoed {:?}, expected {value}",
                reply.values
            )))
        }
    }
}
