use super::{Cmd, Msg, PamStatus, error_chain};
use crate::{
    conv::{Conversation, ConversationChannel, ConversationError, ConversationErrorKind, PromptStyle},
    session::AuthReply,
    stage::Stage,
};
use authd_core::{Access, AuthMode, AuthenticationItem, BrokerInfo, UiLayout};

/// Typing this at any prompt goes one stage back.
const BACK_KEY: &str = "r";

const SUPPORTED_ENTRIES: &str = "optional:chars,chars_password,digits,digits_password";

/// The front-end for text conversations: every choice and every secret is asked with a plain PAM prompt.
///
/// Prompts block until the user answers, so each one runs as a single job on the conversation
/// worker and reports the answer back as a message.
#[derive(Debug)]
pub(crate) struct TerminalModel {
    channel: ConversationChannel,
    brokers: Vec<BrokerInfo>,
    modes: Vec<AuthMode>,
    selected_mode: Option<String>,
    layout: Option<UiLayout>,
    stage: Stage,
    notice: Option<(PromptStyle, String)>,
    logger: slog::Logger,
}

impl TerminalModel {
    pub(crate) fn new(channel: ConversationChannel, logger: slog::Logger) -> Self {
        TerminalModel {
            channel,
            brokers: vec![],
            modes: vec![],
            selected_mode: None,
            layout: None,
            stage: Stage::default(),
            notice: None,
            logger,
        }
    }

    /// The layouts text prompts can render.
    pub(crate) fn supported_layouts() -> Vec<UiLayout> {
        let mut form = UiLayout::new("form");
        form.label = Some("required".into());
        form.entry = Some(SUPPORTED_ENTRIES.into());
        form.wait = Some("optional:true,false".into());
        form.button = Some("optional".into());

        let mut qrcode = UiLayout::new("qrcode");
        qrcode.content = Some("required".into());
        qrcode.wait = Some("required:true,false".into());
        qrcode.label = Some("optional".into());
        qrcode.button = Some("optional".into());

        let mut newpassword = UiLayout::new("newpassword");
        newpassword.label = Some("required".into());
        newpassword.entry = Some(SUPPORTED_ENTRIES.into());
        newpassword.button = Some("optional".into());

        vec![form, qrcode, newpassword]
    }

    pub(super) fn start(&self) -> Cmd {
        Msg::SupportedUiLayoutsReceived {
            layouts: Self::supported_layouts(),
        }
        .into()
    }

    pub(super) fn update(&mut self, msg: &Msg) -> Cmd {
        match msg {
            Msg::UserRequired => self.ask_user(),
            Msg::BrokersListReceived { brokers } => {
                self.brokers = brokers.clone();
                Cmd::None
            }
            Msg::BrokerSelectionRequired => self.ask_broker(),
            Msg::AuthModesReceived { modes } => {
                self.modes = modes.clone();
                self.ask_auth_mode()
            }
            Msg::AuthModeSelected { id: Some(id) } => {
                self.selected_mode = Some(id.clone());
                Cmd::None
            }
            Msg::UiLayoutReceived { layout } => {
                self.layout = Some(layout.clone());
                Cmd::None
            }
            Msg::StartAuthentication => self.ask_challenge(),
            Msg::GoBack => self.go_back(),
            _ => Cmd::None,
        }
    }

    pub(super) fn stage_changed(&mut self, stage: Stage) -> Cmd {
        self.stage = stage;
        if stage <= Stage::AuthModeSelection {
            self.layout = None;
        }
        if stage <= Stage::BrokerSelection {
            self.modes.clear();
            self.selected_mode = None;
        }
        Cmd::None
    }

    /// Queues the broker's message for the next prompt. Final verdicts are shown by the driver.
    pub(super) fn authentication_result(&mut self, reply: &AuthReply, message: Option<&str>) -> Cmd {
        let style = match reply.access {
            Access::Retry => PromptStyle::ErrorMsg,
            Access::Next => {
                self.layout = None;
                PromptStyle::TextInfo
            }
            Access::Granted | Access::Denied | Access::Cancelled => return Cmd::None,
        };
        if let Some(message) = message {
            self.notice = Some((style, message.to_string()));
        }
        Cmd::None
    }

    /// Runs `job` on the conversation worker, after showing any queued notice.
    fn ask<F>(&mut self, job: F) -> Cmd
    where
        F: FnOnce(&Prompter<'_>) -> Result<Msg, ConversationError> + Send + 'static,
    {
        let notice = self.notice.take();
        let channel = self.channel.clone();
        let logger = self.logger.clone();
        Cmd::task(async move {
            let answer = channel
                .run(move |conversation| {
                    let prompter = Prompter { conversation };
                    if let Some((style, text)) = notice {
                        prompter.show(style, &text)?;
                    }
                    job(&prompter)
                })
                .await;
            match answer {
                Ok(msg) => msg.into(),
                Err(e) if e.kind() == ConversationErrorKind::Aborted => {
                    slog::debug!(logger, "Conversation aborted by the user");
                    Cmd::exit(PamStatus::Abort, "cancel requested")
                }
                Err(e) => Cmd::exit(PamStatus::SystemErr, format!("conversation failed: {}", error_chain(&e))),
            }
        })
    }

    fn ask_user(&mut self) -> Cmd {
        self.ask(|prompter| {
            loop {
                if let Reply::Value(username) = prompter.input(PromptStyle::EchoOn, "Username")? {
                    return Ok(Msg::UserSelected { username });
                }
            }
        })
    }

    fn ask_broker(&mut self) -> Cmd {
        match self.brokers.as_slice() {
            [] => Cmd::exit(PamStatus::SystemErr, "No brokers available to select"),
            [broker] => Msg::BrokerSelected {
                broker_id: broker.id.clone(),
            }
            .into(),
            brokers => {
                let ids: Vec<String> = brokers.iter().map(|b| b.id.clone()).collect();
                let labels: Vec<String> = brokers.iter().map(|b| b.name.clone()).collect();
                self.ask(move |prompter| {
                    Ok(match prompter.choose("Broker selection", &labels, "Select broker")? {
                        Choice::Back => Msg::GoBack,
                        Choice::Selected(index) => Msg::BrokerSelected {
                            broker_id: ids[index].clone(),
                        },
                    })
                })
            }
        }
    }

    fn ask_auth_mode(&mut self) -> Cmd {
        match self.modes.as_slice() {
            [] => Cmd::exit(PamStatus::SystemErr, "Can't authenticate without authentication modes"),
            [mode] => Msg::AuthModeSelected {
                id: Some(mode.id.clone()),
            }
            .into(),
            modes => {
                let ids: Vec<String> = modes.iter().map(|m| m.id.clone()).collect();
                let labels: Vec<String> = modes.iter().map(|m| m.label.clone()).collect();
                self.ask(move |prompter| {
                    Ok(
                        match prompter.choose("Authentication mode selection", &labels, "Select authentication mode")? {
                            Choice::Back => Msg::GoBack,
                            Choice::Selected(index) => Msg::AuthModeSelected {
                                id: Some(ids[index].clone()),
                            },
                        },
                    )
                })
            }
        }
    }

    fn ask_challenge(&mut self) -> Cmd {
        let Some(layout) = self.layout.clone() else {
            return Cmd::exit(PamStatus::SystemErr, "Can't authenticate without ui layout selected");
        };
        let entry = layout.entry.clone().unwrap_or_default();
        let Some(entry) = Entry::parse(&entry) else {
            return Cmd::exit(PamStatus::SystemErr, format!("Unhandled entry {entry:?}"));
        };
        let kind = layout.kind.clone();
        match kind.as_str() {
            "form" => {
                let mode = self
                    .selected_mode
                    .as_ref()
                    .and_then(|id| self.modes.iter().find(|m| &m.id == id))
                    .map_or_else(|| "selected authentication mode".to_string(), |m| m.label.clone());
                self.ask(move |prompter| form(prompter, &layout, entry, &mode))
            }
            "qrcode" if !layout.waits() => Cmd::exit(PamStatus::SystemErr, "Can't handle qrcode without waiting"),
            "qrcode" => self.ask(move |prompter| qrcode(prompter, &layout)),
            "newpassword" => self.ask(move |prompter| new_password(prompter, &layout, entry)),
            other => Cmd::exit(PamStatus::SystemErr, format!("unknown layout type: {other:?}")),
        }
    }

    /// Moves back to the closest earlier stage that still offers a choice.
    fn go_back(&mut self) -> Cmd {
        let target = if self.stage > Stage::AuthModeSelection && self.modes.len() > 1 {
            Stage::AuthModeSelection
        } else if self.stage > Stage::BrokerSelection && self.brokers.len() > 1 {
            Stage::BrokerSelection
        } else {
            Stage::UserSelection
        };
        slog::debug!(self.logger, "Going back"; "from" => %self.stage, "to" => %target);

        let ask = match target {
            Stage::AuthModeSelection => {
                self.layout = None;
                self.ask_auth_mode()
            }
            Stage::BrokerSelection => Msg::BrokerSelectionRequired.into(),
            _ => Msg::UserRequired.into(),
        };
        Cmd::sequence([Msg::ChangeStage(target).into(), ask])
    }
}

fn form(prompter: &Prompter<'_>, layout: &UiLayout, entry: Entry, mode: &str) -> Result<Msg, ConversationError> {
    if let Some(button) = layout.button.as_deref().filter(|b| !b.is_empty()) {
        let actions = [format!("Proceed with {mode}"), button.to_string()];
        match prompter.choose(mode, &actions, "Select action")? {
            Choice::Back => return Ok(Msg::GoBack),
            Choice::Selected(1) => return Ok(Msg::ReselectAuthMode),
            Choice::Selected(_) => {}
        }
    }

    let waits = layout.waits();
    let instructions = match (waits, entry) {
        (false, _) => format!("Leave the input field empty or insert '{BACK_KEY}' to cancel the request and go back"),
        (true, Entry::None) => {
            format!("Leave the input field empty to wait for the authentication method or insert '{BACK_KEY}' to go back")
        }
        (true, _) => format!(
            "Leave the input field empty to wait for other authentication method or insert '{BACK_KEY}' to go back"
        ),
    };
    prompter.show(PromptStyle::TextInfo, &instructions)?;

    let item = match prompter.entry(entry, &prompt_label(layout, entry))? {
        Reply::Back => return Ok(Msg::GoBack),
        Reply::Empty if waits => AuthenticationItem::Wait("true".into()),
        Reply::Empty => AuthenticationItem::Challenge(String::new()),
        Reply::Value(challenge) => AuthenticationItem::Challenge(challenge),
    };
    Ok(Msg::AuthenticationRequested { item })
}

fn qrcode(prompter: &Prompter<'_>, layout: &UiLayout) -> Result<Msg, ConversationError> {
    prompter.show(PromptStyle::TextInfo, layout.label.as_deref().unwrap_or_default())?;
    prompter.show(PromptStyle::TextInfo, layout.content.as_deref().unwrap_or_default())?;
    if let Some(code) = layout.code.as_deref().filter(|c| !c.is_empty()) {
        prompter.show(PromptStyle::TextInfo, &format!("Code: {code}"))?;
    }

    let mut actions = vec!["Wait for the QR code scan result".to_string()];
    if let Some(button) = layout.button.as_deref().filter(|b| !b.is_empty()) {
        actions.push(button.to_string());
    }
    Ok(match prompter.choose("Qr Code authentication", &actions, "Select action")? {
        Choice::Back => Msg::GoBack,
        Choice::Selected(0) => Msg::AuthenticationRequested {
            item: AuthenticationItem::Wait("true".into()),
        },
        Choice::Selected(_) => Msg::ReselectAuthMode,
    })
}

fn new_password(prompter: &Prompter<'_>, layout: &UiLayout, entry: Entry) -> Result<Msg, ConversationError> {
    let skip = Msg::AuthenticationRequested {
        item: AuthenticationItem::Skip("true".into()),
    };
    let label = prompt_label(layout, entry);
    loop {
        if let Some(button) = layout.button.as_deref().filter(|b| !b.is_empty()) {
            let actions = ["Proceed with password update".to_string(), button.to_string()];
            match prompter.choose("Password Update", &actions, "Select action")? {
                Choice::Back => return Ok(Msg::GoBack),
                Choice::Selected(1) => return Ok(skip),
                Choice::Selected(_) => {}
            }
        }

        let instructions = format!("Leave the input field empty or insert '{BACK_KEY}' to cancel the request and go back");
        prompter.show(PromptStyle::TextInfo, &instructions)?;
        let first = match prompter.entry(entry, &label)? {
            Reply::Back => return Ok(Msg::GoBack),
            Reply::Empty => return Ok(skip),
            Reply::Value(value) => value,
        };

        prompter.show(PromptStyle::TextInfo, &instructions)?;
        let second = match prompter.entry(entry, &label)? {
            Reply::Back => return Ok(Msg::GoBack),
            Reply::Empty => String::new(),
            Reply::Value(value) => value,
        };

        if first == second {
            return Ok(Msg::AuthenticationRequested {
                item: AuthenticationItem::Challenge(second),
            });
        }
        prompter.show(PromptStyle::ErrorMsg, "Password entries don't match")?;
    }
}

/// The layout label without its trailing colon, or a label matching the entry kind.
fn prompt_label(layout: &UiLayout, entry: Entry) -> String {
    let label = layout.label.as_deref().unwrap_or_default();
    let label = label.strip_suffix(':').unwrap_or(label).trim();
    if !label.is_empty() {
        return label.to_string();
    }
    match entry {
        Entry::Digits | Entry::DigitsPassword => "PIN",
        Entry::Chars => "Value",
        Entry::CharsPassword => "Password",
        Entry::None => "",
    }
    .to_string()
}

/// The entry kinds of a layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Entry {
    None,
    Chars,
    CharsPassword,
    Digits,
    DigitsPassword,
}

impl Entry {
    fn parse(entry: &str) -> Option<Entry> {
        match entry {
            "" => Some(Entry::None),
            "chars" => Some(Entry::Chars),
            "chars_password" => Some(Entry::CharsPassword),
            "digits" => Some(Entry::Digits),
            "digits_password" => Some(Entry::DigitsPassword),
            _ => None,
        }
    }

    fn style(self) -> PromptStyle {
        match self {
            Entry::None | Entry::Chars | Entry::Digits => PromptStyle::EchoOn,
            Entry::CharsPassword | Entry::DigitsPassword => PromptStyle::EchoOff,
        }
    }

    fn numeric(self) -> bool {
        matches!(self, Entry::Digits | Entry::DigitsPassword)
    }
}

/// What the user typed.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Back,
    Empty,
    Value(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Choice {
    Back,
    /// Zero based
    Selected(usize),
}

/// Blocking prompt helpers, used from jobs on the conversation worker only.
struct Prompter<'c> {
    conversation: &'c dyn Conversation,
}

impl Prompter<'_> {
    /// Shows a message. Empty messages are skipped.
    fn show(&self, style: PromptStyle, text: &str) -> Result<(), ConversationError> {
        if !text.is_empty() {
            self.conversation.prompt(style, text)?;
        }
        Ok(())
    }

    fn input(&self, style: PromptStyle, label: &str) -> Result<Reply, ConversationError> {
        let answer = self.conversation.prompt(style, &format!("{label}: "))?;
        Ok(match answer.trim_end_matches('\n') {
            BACK_KEY => Reply::Back,
            "" => Reply::Empty,
            _ => Reply::Value(answer),
        })
    }

    /// Asks until the answer is made of digits only, going back or empty.
    fn numeric(&self, style: PromptStyle, label: &str) -> Result<Reply, ConversationError> {
        loop {
            match self.input(style, label)? {
                Reply::Value(value) if value.parse::<u64>().is_err() => {
                    self.show(PromptStyle::ErrorMsg, "Provided input can't be parsed as integer value")?;
                }
                reply => return Ok(reply),
            }
        }
    }

    fn entry(&self, entry: Entry, label: &str) -> Result<Reply, ConversationError> {
        if entry.numeric() {
            self.numeric(entry.style(), label)
        } else {
            self.input(entry.style(), label)
        }
    }

    /// Shows a numbered menu until a listed entry is picked or the user goes back.
    fn choose(&self, title: &str, labels: &[String], prompt: &str) -> Result<Choice, ConversationError> {
        let mut menu = format!("== {title} (use '{BACK_KEY}' to go back) ==\n");
        for (index, label) in labels.iter().enumerate() {
            menu.push_str(&format!("{} - {label}\n", index + 1));
        }
        menu.push_str(prompt);

        loop {
            match self.numeric(PromptStyle::EchoOn, &menu)? {
                Reply::Back => return Ok(Choice::Back),
                Reply::Empty => continue,
                Reply::Value(value) => match value.parse::<usize>() {
                    Ok(index) if (1..=labels.len()).contains(&index) => return Ok(Choice::Selected(index - 1)),
                    _ => self.show(PromptStyle::ErrorMsg, &format!("Invalid entry. Try again or input '{BACK_KEY}'."))?,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::PamOutcome, relay::BinaryMessage};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::sync::Mutex;

    /// Replays scripted answers to echo prompts and records everything shown.
    #[derive(Debug)]
    struct Script {
        answers: Mutex<Vec<String>>,
        shown: Mutex<Vec<(PromptStyle, String)>>,
    }

    impl Script {
        fn new(answers: &[&str]) -> Self {
            Script {
                answers: Mutex::new(answers.iter().rev().map(|a| a.to_string()).collect()),
                shown: Mutex::new(vec![]),
            }
        }

        fn shown(&self, style: PromptStyle) -> Vec<String> {
            let shown = self.shown.lock().unwrap();
            shown.iter().filter(|(s, _)| *s == style).map(|(_, t)| t.clone()).collect()
        }
    }

    impl Conversation for Script {
        fn prompt(&self, style: PromptStyle, text: &str) -> Result<String, ConversationError> {
            self.shown.lock().unwrap().push((style, text.to_string()));
            match style {
                PromptStyle::EchoOn | PromptStyle::EchoOff => {
                    self.answers.lock().unwrap().pop().ok_or(ConversationErrorKind::Aborted.into())
                }
                _ => Ok(String::new()),
            }
        }

        fn binary_prompt(&self, _message: &BinaryMessage) -> Result<BinaryMessage, ConversationError> {
            Err(ConversationErrorKind::Unsupported.into())
        }
    }

    fn item(msg: Msg) -> AuthenticationItem {
        match msg {
            Msg::AuthenticationRequested { item } => item,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn labels(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn menu_reprompts_on_invalid_entries() {
        let script = Script::new(&["abc", "7", "2"]);
        let prompter = Prompter { conversation: &script };
        let choice = prompter.choose("Broker selection", &labels(&["Local", "Example"]), "Select broker").unwrap();
        assert_eq!(choice, Choice::Selected(1));
        assert_eq!(
            script.shown(PromptStyle::ErrorMsg),
            vec![
                "Provided input can't be parsed as integer value".to_string(),
                "Invalid entry. Try again or input 'r'.".to_string(),
            ]
        );
        assert_eq!(
            script.shown(PromptStyle::EchoOn)[0],
            "== Broker selection (use 'r' to go back) ==\n1 - Local\n2 - Example\nSelect broker: "
        );
    }

    #[test]
    fn menu_goes_back() {
        let script = Script::new(&["r"]);
        let prompter = Prompter { conversation: &script };
        assert_eq!(prompter.choose("t", &labels(&["a"]), "p").unwrap(), Choice::Back);
    }

    #[rstest]
    #[case::password("chars_password", "goodpass", PromptStyle::EchoOff, "Password: ")]
    #[case::pin("digits_password", "4242", PromptStyle::EchoOff, "PIN: ")]
    #[case::plain("chars", "value", PromptStyle::EchoOn, "Value: ")]
    fn form_prompts_by_entry(#[case] entry: &str, #[case] answer: &str, #[case] style: PromptStyle, #[case] label: &str) {
        let script = Script::new(&[answer]);
        let prompter = Prompter { conversation: &script };
        let mut layout = UiLayout::new("form");
        layout.entry = Some(entry.into());
        let entry = Entry::parse(entry).unwrap();

        let msg = form(&prompter, &layout, entry, "Password").unwrap();
        assert_eq!(item(msg), AuthenticationItem::Challenge(answer.into()));
        assert_eq!(script.shown(style), vec![label.to_string()]);
    }

    #[test]
    fn empty_reply_to_a_waiting_form_waits() {
        let script = Script::new(&[""]);
        let prompter = Prompter { conversation: &script };
        let mut layout = UiLayout::new("form");
        layout.label = Some("Confirm on your phone:".into());
        layout.wait = Some("true".into());

        let msg = form(&prompter, &layout, Entry::None, "Phone").unwrap();
        assert_eq!(item(msg), AuthenticationItem::Wait("true".into()));
        assert_eq!(script.shown(PromptStyle::EchoOn), vec!["Confirm on your phone: ".to_string()]);
    }

    #[test]
    fn form_button_reselects_the_mode() {
        let script = Script::new(&["2"]);
        let prompter = Prompter { conversation: &script };
        let mut layout = UiLayout::new("form");
        layout.entry = Some("chars".into());
        layout.button = Some("Resend code".into());

        assert!(matches!(form(&prompter, &layout, Entry::Chars, "Email code").unwrap(), Msg::ReselectAuthMode));
    }

    #[test]
    fn new_password_entries_must_match() {
        let script = Script::new(&["first", "second", "same", "same"]);
        let prompter = Prompter { conversation: &script };
        let mut layout = UiLayout::new("newpassword");
        layout.label = Some("New password:".into());

        let msg = new_password(&prompter, &layout, Entry::CharsPassword).unwrap();
        assert_eq!(item(msg), AuthenticationItem::Challenge("same".into()));
        assert_eq!(script.shown(PromptStyle::ErrorMsg), vec!["Password entries don't match".to_string()]);
    }

    #[test]
    fn empty_new_password_skips() {
        let script = Script::new(&[""]);
        let prompter = Prompter { conversation: &script };
        let msg = new_password(&prompter, &UiLayout::new("newpassword"), Entry::CharsPassword).unwrap();
        assert_eq!(item(msg), AuthenticationItem::Skip("true".into()));
    }

    #[test]
    fn qrcode_waits_for_the_scan() {
        let script = Script::new(&["1"]);
        let prompter = Prompter { conversation: &script };
        let mut layout = UiLayout::new("qrcode");
        layout.content = Some("https://login.example.com/qr".into());
        layout.wait = Some("true".into());

        let msg = qrcode(&prompter, &layout).unwrap();
        assert_eq!(item(msg), AuthenticationItem::Wait("true".into()));
        assert!(script.shown(PromptStyle::TextInfo).contains(&"https://login.example.com/qr".to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn go_back_skips_stages_without_choice() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let channel = ConversationChannel::spawn(std::sync::Arc::new(Script::new(&[])));
        let mut terminal = TerminalModel::new(channel, logger);
        terminal.brokers = vec![BrokerInfo::new("example", "Example")];
        terminal.modes = vec![AuthMode::new("password", "Password")];
        terminal.stage = Stage::Challenge;

        match terminal.go_back() {
            Cmd::Sequence(cmds) => {
                assert!(matches!(&cmds[0], Cmd::Msg(Msg::ChangeStage(Stage::UserSelection))));
                assert!(matches!(&cmds[1], Cmd::Msg(Msg::UserRequired)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn aborted_conversation_exits_with_abort() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let channel = ConversationChannel::spawn(std::sync::Arc::new(Script::new(&[])));
        let mut terminal = TerminalModel::new(channel, logger);

        let Cmd::Task(task) = terminal.ask_user() else {
            panic!("expected a prompt job");
        };
        match task.await {
            Cmd::Msg(Msg::Exit(outcome)) => {
                assert_eq!(outcome, PamOutcome::error(PamStatus::Abort, "cancel requested"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
