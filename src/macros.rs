//! Declarative helpers for the protocol tables (command codes, versions, error codes).

/// Defines the `CommandType` enum with `u32` discriminants and a reverse lookup.
macro_rules! define_command_type {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Tuya command codes carried in the frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $val),*
        }

        impl CommandType {
            pub fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $($val => Some(CommandType::$name),)*
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for CommandType {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:?}(0x{:02X})", self, *self as u32)
            }
        }
    };
}

/// Defines the `Version` enum. Each entry carries its wire tag and numeric value.
macro_rules! define_version {
    ($($name:ident = ($tag:literal, $val:literal)),* $(,)?) => {
        /// Supported local protocol versions.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $($name),*
        }

        impl Version {
            /// Version tag as sent on the wire (e.g. `"3.3"`).
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$name => $tag),*
                }
            }

            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($tag => Ok(Version::$name),)*
                    other => Err($crate::error::TuyaError::InvalidVersion(other.to_string())),
                }
            }
        }

        impl TryFrom<f64> for Version {
            type Error = $crate::error::TuyaError;

            fn try_from(value: f64) -> std::result::Result<Self, Self::Error> {
                $(
                    if (value - $val as f64).abs() < 0.001 {
                        return Ok(Version::$name);
                    }
                )*
                Err($crate::error::TuyaError::InvalidVersion(value.to_string()))
            }
        }

        impl TryFrom<f32> for Version {
            type Error = $crate::error::TuyaError;

            fn try_from(value: f32) -> std::result::Result<Self, Self::Error> {
                Version::try_from(value as f64)
            }
        }

        impl TryFrom<&str> for Version {
            type Error = $crate::error::TuyaError;

            fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Defines numeric error code constants plus `get_error_message`.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),* $(,)?) => {
        $(pub const $name: u32 = $code;)*

        /// Human readable description of a numeric error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}
