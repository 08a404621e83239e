//! Line oriented service console.

use core::{fmt, str::FromStr};
use heapless::String;

use crate::{rtd::Bound, thermal::MAX_HYSTERESIS};

/// Help text listing all commands.
pub const HELP: &str = "\
help                     show this help\r
version                  show firmware version\r
status                   show temperatures, fans and bus state\r
diag on|off              periodic diagnostics output\r
bus reset                reset the sensor bus\r
pwm                      show fan duty cycles of all zones\r
pwm <fan> <zone> <pct>   set fan duty cycle of a zone\r
zone                     show zone bounds and hysteresis\r
zone <zone> <low> <high> set temperature bounds of a zone\r
hyst [<c>]               show or set zone hysteresis\r
range [min|max <c>]      show or set plausible RTD range\r
heater on|off            allow or inhibit heating\r
defaults                 restore default settings\r
";

/// Console command.
#[derive(Clone, Copy, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Show help.
    Help,
    /// Show the firmware version.
    Version,
    /// Show status.
    Status,
    /// Enable or disable periodic diagnostics.
    Diagnostics(bool),
    /// Reset the I2C bus.
    BusReset,
    /// Show the duty cycles of all fans and zones.
    DutyTable,
    /// Set the duty cycle of a fan in a zone.
    Duty {
        /// Fan index.
        fan: u8,
        /// Zone index.
        zone: u8,
        /// Duty cycle in percent.
        percent: u8,
    },
    /// Show the zone bounds and hysteresis.
    ZoneTable,
    /// Set the bounds of a zone.
    Zone {
        /// Zone index.
        zone: u8,
        /// Exclusive lower bound in °C.
        low: f32,
        /// Inclusive upper bound in °C.
        high: f32,
    },
    /// Show or set the zone hysteresis in °C.
    Hysteresis(Option<u8>),
    /// Show or move one end of the plausible RTD range.
    Range(Option<(Bound, f32)>),
    /// Allow or inhibit heating.
    Heater(bool),
    /// Restore the default settings.
    Defaults,
}

/// Console command error.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Empty line.
    Empty,
    /// Command is not known.
    Unknown,
    /// Argument is missing.
    MissingArgument,
    /// Argument is malformed or out of range.
    InvalidArgument,
    /// Superfluous argument.
    TooManyArguments,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "empty command",
            Self::Unknown => "unknown command, try help",
            Self::MissingArgument => "missing argument",
            Self::InvalidArgument => "invalid argument",
            Self::TooManyArguments => "too many arguments",
        })
    }
}

fn arg<'a>(args: &mut impl Iterator<Item = &'a str>) -> Result<&'a str, CommandError> {
    args.next().ok_or(CommandError::MissingArgument)
}

fn number<'a, T: FromStr>(args: &mut impl Iterator<Item = &'a str>) -> Result<T, CommandError> {
    arg(args)?.parse().map_err(|_| CommandError::InvalidArgument)
}

fn celsius<'a>(args: &mut impl Iterator<Item = &'a str>) -> Result<f32, CommandError> {
    let value: f32 = number(args)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CommandError::InvalidArgument)
    }
}

fn on_off<'a>(args: &mut impl Iterator<Item = &'a str>) -> Result<bool, CommandError> {
    match arg(args)? {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(CommandError::InvalidArgument),
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, CommandError> {
        let mut args = line.split_ascii_whitespace().peekable();
        let Some(cmd) = args.next() else { return Err(CommandError::Empty) };

        let cmd = match cmd {
            "help" | "?" => Self::Help,
            "version" => Self::Version,
            "status" => Self::Status,
            "diag" => Self::Diagnostics(on_off(&mut args)?),
            "bus" => match arg(&mut args)? {
                "reset" => Self::BusReset,
                _ => return Err(CommandError::InvalidArgument),
            },
            "pwm" if args.peek().is_none() => Self::DutyTable,
            "pwm" => {
                let fan = number(&mut args)?;
                let zone = number(&mut args)?;
                let percent = number(&mut args)?;
                if percent > 100 {
                    return Err(CommandError::InvalidArgument);
                }
                Self::Duty { fan, zone, percent }
            }
            "zone" if args.peek().is_none() => Self::ZoneTable,
            "zone" => {
                let zone = number(&mut args)?;
                let low = celsius(&mut args)?;
                let high = celsius(&mut args)?;
                if high < low {
                    return Err(CommandError::InvalidArgument);
                }
                Self::Zone { zone, low, high }
            }
            "hyst" if args.peek().is_none() => Self::Hysteresis(None),
            "hyst" => {
                let hysteresis = number(&mut args)?;
                if hysteresis > MAX_HYSTERESIS {
                    return Err(CommandError::InvalidArgument);
                }
                Self::Hysteresis(Some(hysteresis))
            }
            "range" if args.peek().is_none() => Self::Range(None),
            "range" => {
                let bound = match arg(&mut args)? {
                    "min" => Bound::Min,
                    "max" => Bound::Max,
                    _ => return Err(CommandError::InvalidArgument),
                };
                Self::Range(Some((bound, celsius(&mut args)?)))
            }
            "heater" => Self::Heater(on_off(&mut args)?),
            "defaults" => Self::Defaults,
            _ => return Err(CommandError::Unknown),
        };

        match args.next() {
            Some(_) => Err(CommandError::TooManyArguments),
            None => Ok(cmd),
        }
    }
}

/// Assembles received bytes into lines.
#[derive(Default)]
pub struct LineBuffer<const N: usize> {
    line: String<N>,
    overflow: bool,
}

impl<const N: usize> LineBuffer<N> {
    /// Creates an empty line buffer.
    pub const fn new() -> Self {
        Self { line: String::new(), overflow: false }
    }

    /// Adds a received byte and returns the line once it is terminated.
    ///
    /// Backspace removes the last character, other control characters and
    /// non-ASCII bytes are ignored. Overlong lines are discarded.
    pub fn push(&mut self, byte: u8) -> Option<String<N>> {
        match byte {
            b'\r' | b'\n' => {
                let line = core::mem::take(&mut self.line);
                if core::mem::take(&mut self.overflow) {
                    warn!("console line exceeds {} characters", N);
                    return None;
                }
                (!line.is_empty()).then_some(line)
            }
            0x08 | 0x7f => {
                self.line.pop();
                None
            }
            0x20..=0x7e => {
                if self.line.push(byte as char).is_err() {
                    self.overflow = true;
                }
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!("help".parse::<Command>(), Ok(Command::Help));
        assert_eq!("  status ".parse::<Command>(), Ok(Command::Status));
        assert_eq!("diag on".parse::<Command>(), Ok(Command::Diagnostics(true)));
        assert_eq!("bus reset".parse::<Command>(), Ok(Command::BusReset));
        assert_eq!("pwm 1 7 90".parse::<Command>(), Ok(Command::Duty { fan: 1, zone: 7, percent: 90 }));
        assert_eq!("zone 0 -99 20".parse::<Command>(), Ok(Command::Zone { zone: 0, low: -99.0, high: 20.0 }));
        assert_eq!("heater off".parse::<Command>(), Ok(Command::Heater(false)));
    }

    #[test]
    fn parses_settings_commands() {
        assert_eq!("version".parse::<Command>(), Ok(Command::Version));
        assert_eq!("defaults".parse::<Command>(), Ok(Command::Defaults));
        assert_eq!("pwm".parse::<Command>(), Ok(Command::DutyTable));
        assert_eq!("zone ".parse::<Command>(), Ok(Command::ZoneTable));
        assert_eq!("hyst".parse::<Command>(), Ok(Command::Hysteresis(None)));
        assert_eq!("hyst 3".parse::<Command>(), Ok(Command::Hysteresis(Some(3))));
        assert_eq!("range".parse::<Command>(), Ok(Command::Range(None)));
        assert_eq!("range max 90".parse::<Command>(), Ok(Command::Range(Some((Bound::Max, 90.0)))));
        assert_eq!("range min -40.5".parse::<Command>(), Ok(Command::Range(Some((Bound::Min, -40.5)))));
    }

    #[test]
    fn rejects_malformed_settings() {
        assert_eq!("hyst 11".parse::<Command>(), Err(CommandError::InvalidArgument));
        assert_eq!("hyst -1".parse::<Command>(), Err(CommandError::InvalidArgument));
        assert_eq!("range mid 5".parse::<Command>(), Err(CommandError::InvalidArgument));
        assert_eq!("range max".parse::<Command>(), Err(CommandError::MissingArgument));
        assert_eq!("range min inf".parse::<Command>(), Err(CommandError::InvalidArgument));
        assert_eq!("zone 2 nan 30".parse::<Command>(), Err(CommandError::InvalidArgument));
        assert_eq!("pwm 1".parse::<Command>(), Err(CommandError::MissingArgument));
        assert_eq!("defaults now".parse::<Command>(), Err(CommandError::TooManyArguments));
        assert_eq!("version 2".parse::<Command>(), Err(CommandError::TooManyArguments));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!("".parse::<Command>(), Err(CommandError::Empty));
        assert_eq!("reboot".parse::<Command>(), Err(CommandError::Unknown));
        assert_eq!("diag".parse::<Command>(), Err(CommandError::MissingArgument));
        assert_eq!("diag maybe".parse::<Command>(), Err(CommandError::InvalidArgument));
        assert_eq!("pwm 0 1 101".parse::<Command>(), Err(CommandError::InvalidArgument));
        assert_eq!("zone 1 30 20".parse::<Command>(), Err(CommandError::InvalidArgument));
        assert_eq!("status now".parse::<Command>(), Err(CommandError::TooManyArguments));
    }

    #[test]
    fn assembles_lines() {
        let mut buf = LineBuffer::<16>::new();

        assert_eq!(b"stat".iter().find_map(|&b| buf.push(b)), None);
        assert_eq!(buf.push(b'x'), None);
        assert_eq!(buf.push(0x7f), None);
        assert_eq!(buf.push(b'u'), None);
        assert_eq!(buf.push(b's'), None);
        assert_eq!(buf.push(b'\r').as_deref(), Some("status"));

        // Empty lines from CR LF are skipped.
        assert_eq!(buf.push(b'\n'), None);
    }

    #[test]
    fn discards_overlong_lines() {
        let mut buf = LineBuffer::<4>::new();

        assert_eq!(b"status".iter().find_map(|&b| buf.push(b)), None);
        assert_eq!(buf.push(b'\n'), None);
        assert_eq!(b"help\n".iter().find_map(|&b| buf.push(b)).as_deref(), Some("help"));
    }
}
