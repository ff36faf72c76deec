use authd_core::{AuthMode, BrokerInfo, UiLayout};

/// The user stage: who is authenticating.
#[derive(Debug, Default)]
pub(crate) struct UserSelection {
    username: Option<String>,
}

impl UserSelection {
    pub(crate) fn select(&mut self, username: String) {
        self.username = Some(username).filter(|u| !u.is_empty());
    }

    pub(crate) fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub(crate) fn reset(&mut self) {
        self.username = None;
    }
}

/// The broker stage: the broker list and the chosen broker.
#[derive(Debug, Default)]
pub(crate) struct BrokerSelection {
    available: Option<Vec<BrokerInfo>>,
    selected: Option<String>,
}

impl BrokerSelection {
    pub(crate) fn set_available(&mut self, brokers: Vec<BrokerInfo>) {
        self.available = Some(brokers);
    }

    /// `None` until the broker list was fetched.
    pub(crate) fn available(&self) -> Option<&[BrokerInfo]> {
        self.available.as_deref()
    }

    pub(crate) fn contains(&self, broker_id: &str) -> bool {
        self.available().is_some_and(|brokers| brokers.iter().any(|b| b.id == broker_id))
    }

    pub(crate) fn select(&mut self, broker_id: &str) {
        self.selected = Some(broker_id.to_string());
    }

    pub(crate) fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Forgets the choice. The list is kept, it does not depend on the user.
    pub(crate) fn reset(&mut self) {
        self.selected = None;
    }
}

/// The authentication mode stage.
#[derive(Debug, Default)]
pub(crate) struct AuthModeSelection {
    supported_layouts: Option<Vec<UiLayout>>,
    modes: Vec<AuthMode>,
    current: Option<String>,
}

impl AuthModeSelection {
    pub(crate) fn set_supported_layouts(&mut self, layouts: Vec<UiLayout>) {
        self.supported_layouts = Some(layouts);
    }

    /// `None` until the front-end told which layouts it renders.
    pub(crate) fn supported_layouts(&self) -> Option<&[UiLayout]> {
        self.supported_layouts.as_deref()
    }

    pub(crate) fn set_modes(&mut self, modes: Vec<AuthMode>) {
        self.modes = modes;
    }

    pub(crate) fn contains(&self, auth_mode_id: &str) -> bool {
        self.modes.iter().any(|m| m.id == auth_mode_id)
    }

    pub(crate) fn select(&mut self, auth_mode_id: &str) {
        self.current = Some(auth_mode_id.to_string());
    }

    pub(crate) fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Forgets the modes of the previous session. Supported layouts are a front-end property and survive.
    pub(crate) fn reset(&mut self) {
        self.modes.clear();
        self.current = None;
    }
}
