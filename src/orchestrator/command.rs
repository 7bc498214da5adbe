//! Operator commands accepted by the worker loop.

use thiserror::Error;

/// One operator request.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    /// Connect to the given address, or the best known device
    Connect(Option<String>),
    Disconnect,
    Subscribe,
    Unsubscribe,
    Scan,
    StopScan,
    Led(bool),
    TogglePizzaMode,
    Threshold(f64),
    AutoMode(bool),
    AutoConnect(bool),
    AcknowledgeLowBattery,
    /// Write raw text to the peripheral
    Send(String),
    Status,
}

/// Why an operator line was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{0} needs an argument")]
    MissingArgument(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn on_off(word: Option<&str>, command: &'static str) -> Result<bool, CommandParseError> {
    match word {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        Some(other) => Err(CommandParseError::InvalidArgument(other.to_string())),
        None => Err(CommandParseError::MissingArgument(command)),
    }
}

impl UserCommand {
    /// Parse one operator line.
    ///
    /// ```
    /// use pizzabot::orchestrator::command::UserCommand;
    ///
    /// assert_eq!(UserCommand::parse("led on"), Ok(UserCommand::Led(true)));
    /// assert_eq!(UserCommand::parse("threshold 50"), Ok(UserCommand::Threshold(50.0)));
    /// ```
    pub fn parse(line: &str) -> Result<Self, CommandParseError> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let arg = (!rest.is_empty()).then_some(rest);

        match word.to_ascii_lowercase().as_str() {
            "" => Err(CommandParseError::Empty),
            "connect" => Ok(UserCommand::Connect(arg.map(str::to_string))),
            "disconnect" => Ok(UserCommand::Disconnect),
            "subscribe" => Ok(UserCommand::Subscribe),
            "unsubscribe" => Ok(UserCommand::Unsubscribe),
            "scan" => Ok(UserCommand::Scan),
            "stop" => Ok(UserCommand::StopScan),
            "led" => on_off(arg, "led").map(UserCommand::Led),
            "pizza" => Ok(UserCommand::TogglePizzaMode),
            "threshold" => {
                let value = arg.ok_or(CommandParseError::MissingArgument("threshold"))?;
                value
                    .parse::<f64>()
                    .map(UserCommand::Threshold)
                    .map_err(|_| CommandParseError::InvalidArgument(value.to_string()))
            }
            "auto" => on_off(arg, "auto").map(UserCommand::AutoMode),
            "autoconnect" => on_off(arg, "autoconnect").map(UserCommand::AutoConnect),
            "ack" => Ok(UserCommand::AcknowledgeLowBattery),
            "send" => arg
                .map(|text| UserCommand::Send(text.to_string()))
                .ok_or(CommandParseError::MissingArgument("send")),
            "status" => Ok(UserCommand::Status),
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }
}
