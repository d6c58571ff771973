// ── Modbus link ──
//
// One `ModbusConnection` per TCP gateway or serial port. The tokio-modbus
// context is opened lazily, shared by every unit id on the bus, and thrown
// away after a timeout or I/O failure so the next request starts clean.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::local::{LocalTransport, RegisterIo, RegisterTable};
use crate::transport::{Endpoint, RegisterRange, TransportKind};

/// A device addressed over Modbus TCP or RTU.
pub type ModbusTransport = LocalTransport<ModbusConnection>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default RS485 baud rate for hybrid inverters.
pub const DEFAULT_BAUD_RATE: u32 = 19_200;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Tcp { host: String, port: u16 },
    Serial { path: String, baud_rate: u32 },
}

/// A shared Modbus bus (TCP gateway or RS485 adapter).
pub struct ModbusConnection {
    link: Link,
    endpoint: Endpoint,
    context: Mutex<Option<Context>>,
}

impl ModbusConnection {
    pub fn tcp(host: impl Into<String>, port: u16) -> Arc<Self> {
        let host = host.into();
        Arc::new(Self {
            endpoint: Endpoint::Tcp {
                host: host.clone(),
                port,
            },
            link: Link::Tcp { host, port },
            context: Mutex::new(None),
        })
    }

    pub fn serial(path: impl Into<String>, baud_rate: u32) -> Arc<Self> {
        let path = path.into();
        Arc::new(Self {
            endpoint: Endpoint::Serial { path: path.clone() },
            link: Link::Serial { path, baud_rate },
            context: Mutex::new(None),
        })
    }

    fn connection_error(&self, reason: impl ToString) -> Error {
        Error::Connection {
            endpoint: self.endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn new_context(&self) -> Result<Context, Error> {
        match &self.link {
            Link::Tcp { host, port } => {
                info!(endpoint = %self.endpoint, "connecting");
                let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| self.connection_error("timed out while connecting"))?
                    .map_err(|e| self.connection_error(e))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| self.connection_error(e))?;
                info!(endpoint = %self.endpoint, "connected");
                Ok(tokio_modbus::client::tcp::attach_slave(stream, Slave(1)))
            }
            Link::Serial { path, baud_rate } => {
                info!(endpoint = %self.endpoint, baud_rate, "opening serial port");
                let port = tokio_serial::new(path, *baud_rate)
                    .timeout(CONNECT_TIMEOUT)
                    .open_native_async()
                    .map_err(|e| self.connection_error(e))?;
                Ok(tokio_modbus::client::rtu::attach_slave(port, Slave(1)))
            }
        }
    }

    /// Fill in the endpoint of a converted tokio-modbus error.
    fn locate(&self, err: Error) -> Error {
        match err {
            Error::Connection { endpoint, reason } if endpoint.is_empty() => {
                self.connection_error(reason)
            }
            other => other,
        }
    }
}

#[async_trait]
impl RegisterIo for ModbusConnection {
    type Address = u8;

    fn kind(&self) -> TransportKind {
        match self.link {
            Link::Tcp { .. } => TransportKind::ModbusTcp,
            Link::Serial { .. } => TransportKind::ModbusSerial,
        }
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open(&self) -> Result<(), Error> {
        let mut guard = self.context.lock().await;
        if guard.is_none() {
            *guard = Some(self.new_context().await?);
        }
        Ok(())
    }

    async fn close(&self) {
        if self.context.lock().await.take().is_some() {
            debug!(endpoint = %self.endpoint, "modbus context closed");
        }
    }

    async fn read(
        &self,
        unit: &u8,
        table: RegisterTable,
        range: RegisterRange,
        deadline: Duration,
    ) -> Result<Vec<u16>, Error> {
        let mut guard = self.context.lock().await;
        let Some(ctx) = guard.as_mut() else {
            return Err(Error::NotConnected {
                endpoint: self.endpoint.to_string(),
            });
        };
        ctx.set_slave(Slave(*unit));
        debug!(endpoint = %self.endpoint, unit, %range, ?table, "reading");

        let request = async {
            let words = match table {
                RegisterTable::Input => ctx.read_input_registers(range.start, range.count).await,
                RegisterTable::Holding => {
                    ctx.read_holding_registers(range.start, range.count).await
                }
            };
            Ok::<_, Error>(words??)
        };
        let result = match timeout(deadline, request).await {
            Ok(result) => result.map_err(|e| self.locate(e)),
            Err(_) => Err(Error::timeout(deadline)),
        };

        if let Err(e) = &result {
            if e.is_connection_lost() || matches!(e, Error::Timeout { .. }) {
                warn!(endpoint = %self.endpoint, unit, error = %e, "dropping modbus context");
                *guard = None;
            }
        }
        result
    }

    async fn write(
        &self,
        unit: &u8,
        register: u16,
        value: u16,
        deadline: Duration,
    ) -> Result<(), Error> {
        let mut guard = self.context.lock().await;
        let Some(ctx) = guard.as_mut() else {
            return Err(Error::NotConnected {
                endpoint: self.endpoint.to_string(),
            });
        };
        ctx.set_slave(Slave(*unit));
        info!(endpoint = %self.endpoint, unit, register, value, "writing holding register");

        let request = async {
            ctx.write_single_register(register, value).await??;
            Ok::<_, Error>(())
        };
        let result = match timeout(deadline, request).await {
            Ok(result) => result.map_err(|e| self.locate(e)),
            Err(_) => Err(Error::timeout(deadline)),
        };
        if let Err(e) = &result {
            if e.is_connection_lost() || matches!(e, Error::Timeout { .. }) {
                *guard = None;
            }
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_identity_follows_link() {
        let tcp = ModbusConnection::tcp("192.168.1.20", 502);
        assert_eq!(tcp.kind(), TransportKind::ModbusTcp);
        assert_eq!(tcp.endpoint().to_string(), "192.168.1.20:502");

        let serial = ModbusConnection::serial("/dev/ttyUSB0", DEFAULT_BAUD_RATE);
        assert_eq!(serial.kind(), TransportKind::ModbusSerial);
        assert_eq!(
            serial.endpoint(),
            &Endpoint::Serial {
                path: "/dev/ttyUSB0".into()
            }
        );
    }

    #[tokio::test]
    async fn read_before_open_is_not_connected() {
        let conn = ModbusConnection::tcp("127.0.0.1", 1);
        let err = conn
            .read(&1, RegisterTable::Input, RegisterRange::new(0, 10), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected { .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = ModbusConnection::tcp("127.0.0.1", port);
        let err = conn.open().await.unwrap_err();
        assert!(err.is_connection_lost(), "unexpected error: {err}");
    }
}
