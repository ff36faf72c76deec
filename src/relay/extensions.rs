/// The PAM extension the graphical login manager uses for custom JSON messages.
pub const JSON_EXTENSION: &str = "org.gnome.DisplayManager.UserVerifier.CustomJSON";

/// The environment variable holding the space separated list of extensions the login manager supports.
pub const SUPPORTED_EXTENSIONS_ENV: &str = "GDM_SUPPORTED_PAM_EXTENSIONS";

/// The set of PAM binary-prompt extensions advertised by the conversation peer.
///
/// Advertised order matters: the type byte of an extension's messages is its 1-based position in
/// the list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SupportedExtensions {
    names: Vec<String>,
}

impl SupportedExtensions {
    /// Creates the set from a list of extension names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SupportedExtensions {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a space separated extension list.
    pub fn parse(value: &str) -> Self {
        Self::new(value.split_whitespace())
    }

    /// Reads the list advertised through [`SUPPORTED_EXTENSIONS_ENV`].
    pub fn from_env() -> Self {
        std::env::var(SUPPORTED_EXTENSIONS_ENV).map(|v| Self::parse(&v)).unwrap_or_default()
    }

    /// Whether `name` was advertised.
    pub fn is_supported(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// The message type byte for `name`, if advertised.
    pub fn extension_type(&self, name: &str) -> Option<u8> {
        let index = self.names.iter().position(|n| n == name)?;
        u8::try_from(index + 1).ok()
    }

    /// The value to export in [`SUPPORTED_EXTENSIONS_ENV`] to advertise this set.
    pub fn to_env_value(&self) -> String {
        self.names.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn type_byte_is_one_based_position() {
        let exts = SupportedExtensions::parse("org.example.Private  org.gnome.DisplayManager.UserVerifier.CustomJSON");
        assert!(exts.is_supported(JSON_EXTENSION));
        assert_eq!(exts.extension_type(JSON_EXTENSION), Some(2));
        assert_eq!(exts.extension_type("org.example.Missing"), None);
    }

    #[test]
    fn env_value_round_trips() {
        let exts = SupportedExtensions::new([JSON_EXTENSION, "org.example.Private"]);
        assert_eq!(SupportedExtensions::parse(&exts.to_env_value()), exts);
        assert!(!SupportedExtensions::default().is_supported(JSON_EXTENSION));
    }
}
