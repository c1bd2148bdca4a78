//! Command dispatcher: the symbolic surface consumed by binding layers.
//!
//! Command names are resolved once into [`Command`]. Dispatch is an
//! exhaustive match, so every recognised command has exactly one handler
//! and unrecognised names fail instead of silently doing nothing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::{BridgeConfig, ConfigField, SessionConfig};
use crate::constants::{DEFAULT_LIST_RESULTS, DEFAULT_READ_SIZE, MAX_READ_SIZE};
use crate::discovery::{DeviceDescriptor, Discovery};
use crate::error::{BridgeError, Result};
use crate::events::{BridgeObserver, TracingObserver};
use crate::policy::SessionPolicy;
use crate::session::Session;
use crate::transport::UsbBackend;

/// Loosely typed argument as handed over by a binding layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandArg {
    Number(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl CommandArg {
    fn as_integer(&self) -> Option<u64> {
        match self {
            CommandArg::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n <= u64::MAX as f64 => {
                Some(*n as u64)
            }
            _ => None,
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            CommandArg::Text(s) => Some(s),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            CommandArg::Bytes(b) => Some(b.clone()),
            CommandArg::Text(s) => Some(s.as_bytes().to_vec()),
            CommandArg::Number(_) => None,
        }
    }
}

impl From<u32> for CommandArg {
    fn from(n: u32) -> Self {
        CommandArg::Number(f64::from(n))
    }
}

impl From<&str> for CommandArg {
    fn from(s: &str) -> Self {
        CommandArg::Text(s.to_string())
    }
}

impl From<Vec<u8>> for CommandArg {
    fn from(b: Vec<u8>) -> Self {
        CommandArg::Bytes(b)
    }
}

/// Result value of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutput {
    Devices(Vec<DeviceDescriptor>),
    Bool(bool),
    Count(usize),
    Bytes(Vec<u8>),
    Config(SessionConfig),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List {
        max_results: usize,
    },
    Open {
        vendor_id: u16,
        product_id: u16,
        serial: Option<String>,
    },
    Write(Vec<u8>),
    Read {
        count: usize,
    },
    Close,
    SetConfig {
        field: ConfigField,
        value: u32,
    },
    GetConfig,
    Ping,
    Flush,
    Unknown(String),
}

impl Command {
    /// Resolve a command name and its arguments.
    ///
    /// An unrecognised name is not an error here. It parses to
    /// [`Command::Unknown`] and fails on execution.
    pub fn parse(name: &str, args: &[CommandArg]) -> Result<Self> {
        let command = match name {
            "list" => Command::List {
                max_results: integer(args, 0, "max_results")?.unwrap_or(DEFAULT_LIST_RESULTS),
            },
            "open" => Command::Open {
                vendor_id: required(integer(args, 0, "vendor_id")?, "vendor_id")?,
                product_id: required(integer(args, 1, "product_id")?, "product_id")?,
                serial: match args.get(2) {
                    None => None,
                    Some(arg) => Some(
                        arg.as_text()
                            .ok_or_else(|| {
                                BridgeError::InvalidArgument("serial must be a string".into())
                            })?
                            .to_string(),
                    ),
                },
            },
            "write" => Command::Write(
                args.first()
                    .and_then(CommandArg::to_bytes)
                    .ok_or_else(|| BridgeError::InvalidArgument("write expects data".into()))?,
            ),
            "read" => Command::Read {
                count: integer(args, 0, "count")?.unwrap_or(DEFAULT_READ_SIZE),
            },
            "close" => Command::Close,
            "setConfig" => {
                let field = args
                    .first()
                    .and_then(CommandArg::as_text)
                    .ok_or_else(|| BridgeError::InvalidArgument("missing field name".into()))?
                    .parse::<ConfigField>()?;
                Command::SetConfig {
                    field,
                    value: required(integer(args, 1, "value")?, "value")?,
                }
            }
            "getConfig" => Command::GetConfig,
            "ping" => Command::Ping,
            "flush" => Command::Flush,
            other => Command::Unknown(other.to_string()),
        };
        Ok(command)
    }

    pub fn name(&self) -> &str {
        match self {
            Command::List { .. } => "list",
            Command::Open { .. } => "open",
            Command::Write(_) => "write",
            Command::Read { .. } => "read",
            Command::Close => "close",
            Command::SetConfig { .. } => "setConfig",
            Command::GetConfig => "getConfig",
            Command::Ping => "ping",
            Command::Flush => "flush",
            Command::Unknown(name) => name,
        }
    }
}

fn integer<T: TryFrom<u64>>(args: &[CommandArg], index: usize, name: &str) -> Result<Option<T>> {
    let Some(arg) = args.get(index) else {
        return Ok(None);
    };
    arg.as_integer()
        .and_then(|n| T::try_from(n).ok())
        .map(Some)
        .ok_or_else(|| BridgeError::InvalidArgument(format!("{name} out of range: {arg:?}")))
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| BridgeError::InvalidArgument(format!("missing {name}")))
}

/// Single entry point for a binding layer. Owns one discovery instance and
/// one policy-wrapped session.
pub struct CommandDispatcher {
    discovery: Discovery,
    policy: SessionPolicy,
}

impl CommandDispatcher {
    pub fn new(backend: Arc<dyn UsbBackend>, config: &BridgeConfig) -> Self {
        Self::with_observer(backend, config, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        backend: Arc<dyn UsbBackend>,
        config: &BridgeConfig,
        observer: Arc<dyn BridgeObserver>,
    ) -> Self {
        let discovery = Discovery::new(Arc::clone(&backend), config.vendor_ids.clone())
            .with_string_timeout(config.discovery_timeout());
        let session = Session::with_config(backend, config.session.clone()).with_observer(observer);
        Self {
            discovery,
            policy: SessionPolicy::new(session).with_max_retries(config.max_retries),
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn session(&self) -> &Session {
        self.policy.session()
    }

    pub fn execute_named(&mut self, name: &str, args: &[CommandArg]) -> Result<CommandOutput> {
        let command = Command::parse(name, args)?;
        self.execute(command)
    }

    #[instrument(skip_all, fields(command = %command.name()))]
    pub fn execute(&mut self, command: Command) -> Result<CommandOutput> {
        let output = match command {
            Command::List { max_results } => {
                CommandOutput::Devices(self.discovery.discover(max_results))
            }
            Command::Open {
                vendor_id,
                product_id,
                serial,
            } => {
                let descriptor = DeviceDescriptor::new(vendor_id, product_id)
                    .with_serial(serial.unwrap_or_default());
                self.policy.open(&descriptor)?;
                CommandOutput::Bool(true)
            }
            Command::Write(data) => {
                if data.is_empty() {
                    return Err(self.reject("write expects at least one byte".into()));
                }
                CommandOutput::Count(self.policy.send(&data)?)
            }
            Command::Read { count } => {
                if count == 0 || count > MAX_READ_SIZE {
                    return Err(self.reject(format!(
                        "read count must be 1..={MAX_READ_SIZE}, got {count}"
                    )));
                }
                CommandOutput::Bytes(self.policy.read(count)?)
            }
            Command::Close => {
                self.policy.close();
                CommandOutput::Bool(true)
            }
            Command::SetConfig { field, value } => {
                let next = match self.policy.session().config().with_field(field, value) {
                    Ok(next) => next,
                    Err(err) => return Err(self.policy.session_mut().fail(err)),
                };
                self.policy.session_mut().configure(next)?;
                CommandOutput::Bool(true)
            }
            Command::GetConfig => CommandOutput::Config(self.policy.session().config().clone()),
            Command::Ping => CommandOutput::Bool(self.policy.ping()),
            Command::Flush => {
                self.policy.flush();
                CommandOutput::None
            }
            Command::Unknown(name) => return Err(BridgeError::UnknownCommand(name)),
        };
        debug!(?output, "Command complete");
        Ok(output)
    }

    fn reject(&mut self, message: String) -> BridgeError {
        self.policy
            .session_mut()
            .fail(BridgeError::InvalidArgument(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::state::ConnectionState;
    use crate::transport::{MockBackend, MockDevice};

    fn dispatcher(device: &MockDevice) -> CommandDispatcher {
        CommandDispatcher::new(
            Arc::new(MockBackend::with_device(device.clone())),
            &BridgeConfig::default(),
        )
    }

    fn open_args() -> Vec<CommandArg> {
        vec![0x0483u32.into(), 0x5740u32.into()]
    }

    #[test]
    fn test_loopback_scenario() {
        let device = MockDevice::new(0x0483, 0x5740).with_echo();
        let mut bridge = dispatcher(&device);

        assert_eq!(
            bridge.execute_named("open", &open_args()).unwrap(),
            CommandOutput::Bool(true)
        );
        assert_eq!(
            bridge
                .execute_named("setConfig", &["endpoint_in".into(), 0x81u32.into()])
                .unwrap(),
            CommandOutput::Bool(true)
        );
        assert_eq!(
            bridge
                .execute_named("write", &[vec![1u8, 2, 3, 4].into()])
                .unwrap(),
            CommandOutput::Count(4)
        );
        assert_eq!(
            bridge.execute_named("read", &[64u32.into()]).unwrap(),
            CommandOutput::Bytes(vec![1, 2, 3, 4])
        );
        assert_eq!(
            bridge.execute_named("close", &[]).unwrap(),
            CommandOutput::Bool(true)
        );
        assert_eq!(
            bridge.execute_named("close", &[]).unwrap(),
            CommandOutput::Bool(true)
        );
        assert!(!device.is_claimed());
    }

    #[test]
    fn test_unknown_command() {
        let device = MockDevice::new(0x0483, 0x5740);
        let mut bridge = dispatcher(&device);

        let err = bridge.execute_named("reboot", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownCommand(ref name) if name == "reboot"));
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_unknown_config_field() {
        let device = MockDevice::new(0x0483, 0x5740);
        let mut bridge = dispatcher(&device);
        bridge.execute_named("open", &open_args()).unwrap();

        let err = bridge
            .execute_named("setConfig", &["baud_rate".into(), 9600u32.into()])
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownField(_)));
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_set_config_never_half_applies() {
        let device = MockDevice::new(0x0483, 0x5740);
        let mut bridge = dispatcher(&device);
        bridge.execute_named("open", &open_args()).unwrap();

        // Out of range endpoint
        assert!(bridge
            .execute_named("setConfig", &["endpoint_out".into(), 0x1FFu32.into()])
            .is_err());
        // IN endpoint used as OUT
        assert!(bridge
            .execute_named("setConfig", &["endpoint_out".into(), 0x81u32.into()])
            .is_err());
        assert!(bridge
            .execute_named("setConfig", &["timeout_ms".into(), 0u32.into()])
            .is_err());

        assert_eq!(
            bridge.execute_named("getConfig", &[]).unwrap(),
            CommandOutput::Config(SessionConfig::default())
        );

        bridge
            .execute_named("setConfig", &["timeout_ms".into(), 250u32.into()])
            .unwrap();
        let CommandOutput::Config(config) = bridge.execute_named("getConfig", &[]).unwrap() else {
            panic!("expected config");
        };
        assert_eq!(config.timeout_ms, 250);
    }

    #[test]
    fn test_set_config_requires_open() {
        let device = MockDevice::new(0x0483, 0x5740);
        let mut bridge = dispatcher(&device);

        let err = bridge
            .execute_named("setConfig", &["timeout_ms".into(), 250u32.into()])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
        assert_eq!(bridge.session().last_error(), ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_read_bounds_checked_before_io() {
        let device = MockDevice::new(0x0483, 0x5740);
        device.queue_rx(b"pending");
        let mut bridge = dispatcher(&device);
        bridge.execute_named("open", &open_args()).unwrap();

        for count in [0u32, 65537] {
            let err = bridge.execute_named("read", &[count.into()]).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidConfig);
        }
        assert_eq!(device.transfer_count(), 0);
        assert_eq!(device.rx_pending(), 1);

        // Default count
        assert_eq!(
            bridge.execute_named("read", &[]).unwrap(),
            CommandOutput::Bytes(b"pending".to_vec())
        );
    }

    #[test]
    fn test_read_bounded_by_buffer_size() {
        let device = MockDevice::new(0x0483, 0x5740);
        device.queue_rx(&[7u8; 16]);
        let mut bridge = dispatcher(&device);
        bridge.execute_named("open", &open_args()).unwrap();
        bridge
            .execute_named("setConfig", &["buffer_size".into(), 16u32.into()])
            .unwrap();

        let err = bridge.execute_named("read", &[64u32.into()]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::BufferOverflow {
                requested: 64,
                available: 16
            }
        ));
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
        assert_eq!(bridge.session().last_error(), ErrorCode::InvalidConfig);
        assert_eq!(device.transfer_count(), 0);
        assert_eq!(device.rx_pending(), 1);

        assert_eq!(
            bridge.execute_named("read", &[16u32.into()]).unwrap(),
            CommandOutput::Bytes(vec![7u8; 16])
        );
        assert_eq!(bridge.policy().buffered(), 0);
    }

    #[test]
    fn test_empty_write_rejected() {
        let device = MockDevice::new(0x0483, 0x5740);
        let mut bridge = dispatcher(&device);
        bridge.execute_named("open", &open_args()).unwrap();

        let err = bridge
            .execute_named("write", &[Vec::<u8>::new().into()])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_write_text_argument() {
        let device = MockDevice::new(0x0483, 0x5740);
        let mut bridge = dispatcher(&device);
        bridge.execute_named("open", &open_args()).unwrap();

        assert_eq!(
            bridge.execute_named("write", &["AT\r".into()]).unwrap(),
            CommandOutput::Count(3)
        );
        assert_eq!(device.writes(), vec![(0x01, b"AT\r".to_vec())]);
    }

    #[test]
    fn test_open_with_serial() {
        let device = MockDevice::new(0x0483, 0x5740).with_serial("STM001");
        let mut bridge = dispatcher(&device);

        let mut args = open_args();
        args.push("OTHER".into());
        let err = bridge.execute_named("open", &args).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(bridge.session().state(), ConnectionState::Error);

        bridge.execute_named("close", &[]).unwrap();
        let mut args = open_args();
        args.push("STM001".into());
        bridge.execute_named("open", &args).unwrap();
        assert_eq!(bridge.session().state(), ConnectionState::Open);
    }

    #[test]
    fn test_open_twice_is_busy() {
        let device = MockDevice::new(0x0483, 0x5740);
        let mut bridge = dispatcher(&device);
        bridge.execute_named("open", &open_args()).unwrap();

        let err = bridge.execute_named("open", &open_args()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
        assert_eq!(bridge.session().state(), ConnectionState::Open);
        assert_eq!(device.open_count(), 1);
    }

    #[test]
    fn test_list() {
        let backend = MockBackend::new();
        backend.attach(MockDevice::new(0x0403, 0x6001).with_serial("FT1"));
        backend.attach(MockDevice::new(0x046D, 0xC077));
        backend.attach(MockDevice::new(0x0483, 0x5740));
        let mut bridge = CommandDispatcher::new(Arc::new(backend), &BridgeConfig::default());

        let CommandOutput::Devices(found) = bridge.execute_named("list", &[]).unwrap() else {
            panic!("expected devices");
        };
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].serial, "FT1");

        let CommandOutput::Devices(found) = bridge.execute_named("list", &[1u32.into()]).unwrap()
        else {
            panic!("expected devices");
        };
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_ping_and_flush() {
        let device = MockDevice::new(0x0483, 0x5740);
        let mut bridge = dispatcher(&device);

        assert_eq!(
            bridge.execute_named("ping", &[]).unwrap(),
            CommandOutput::Bool(false)
        );
        assert_eq!(
            bridge.execute_named("flush", &[]).unwrap(),
            CommandOutput::None
        );

        bridge.execute_named("open", &open_args()).unwrap();
        device.queue_rx(b"stale");
        assert_eq!(
            bridge.execute_named("ping", &[]).unwrap(),
            CommandOutput::Bool(true)
        );
        assert_eq!(device.rx_pending(), 1);

        bridge.execute_named("flush", &[]).unwrap();
        assert_eq!(device.rx_pending(), 0);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Command::parse("open", &[0x0483u32.into()]),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::parse("open", &[0x10000u32.into(), 1u32.into()]),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::parse("read", &["many".into()]),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::parse("list", &[CommandArg::Number(1.5)]),
            Err(BridgeError::InvalidArgument(_))
        ));
        assert_eq!(
            Command::parse("getConfig", &[]).unwrap(),
            Command::GetConfig
        );
        assert_eq!(Command::parse("Flush", &[]).unwrap().name(), "Flush");
    }
}
