//! Room commands.
//!
//! A command is a `Command` message whose payload is whitespace-separated
//! text: a keyword followed by arguments. Every node replays the same
//! commands in log order, so membership and metadata converge.
//!
//! Handlers mutate [`RoomState`] under the room lock and return [`Effect`]s
//! that the room applies afterwards (spawning or stopping peer workers).

use std::collections::HashMap;
use std::fmt;

use veil_shared::{ContentType, Fingerprint, Message, RemoteIdentity};

use crate::error::CommandError;
use crate::state::RoomState;

pub const INVITE: &str = "invite";
pub const NAME_ROOM: &str = "name_room";
pub const NICK: &str = "nick";
pub const PROMOTE: &str = "promote";
pub const REMOVE_PEER: &str = "remove_peer";

/// A parsed command: keyword plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    keyword: String,
    args: Vec<String>,
}

impl Command {
    pub fn new(keyword: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            keyword: keyword.into(),
            args,
        }
    }

    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let mut parts = text.split_whitespace();
        let keyword = parts.next().ok_or(CommandError::Empty)?;
        Ok(Self::new(keyword, parts.map(str::to_string).collect()))
    }

    pub fn from_message(message: &Message) -> Result<Self, CommandError> {
        if message.content_type != ContentType::Command {
            return Err(CommandError::WrongCommand {
                expected: "command".to_string(),
                found: format!("{:?}", message.content_type).to_lowercase(),
            });
        }
        let text = message.text().map_err(|_| CommandError::Empty)?;
        Self::parse(text)
    }

    pub fn invite(peer: &Fingerprint) -> Self {
        Self::new(INVITE, vec![peer.to_string()])
    }

    /// One `invite` naming several members at once.
    pub fn invite_all<'a, I>(peers: I) -> Self
    where
        I: IntoIterator<Item = &'a Fingerprint>,
    {
        Self::new(INVITE, peers.into_iter().map(Fingerprint::to_string).collect())
    }

    pub fn name_room(name: &str) -> Self {
        Self::new(NAME_ROOM, name.split_whitespace().map(str::to_string).collect())
    }

    pub fn nick(nickname: &str) -> Self {
        Self::new(NICK, nickname.split_whitespace().map(str::to_string).collect())
    }

    pub fn promote(peer: &Fingerprint) -> Self {
        Self::new(PROMOTE, vec![peer.to_string()])
    }

    pub fn remove_peer(peer: &Fingerprint) -> Self {
        Self::new(REMOVE_PEER, vec![peer.to_string()])
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Fail unless at least `needed` arguments are present.
    pub fn require_args(&self, needed: usize) -> Result<(), CommandError> {
        if self.args.len() < needed {
            return Err(CommandError::NotEnoughArguments {
                keyword: self.keyword.clone(),
                needed,
                got: self.args.len(),
            });
        }
        Ok(())
    }

    /// Fail unless this command carries `keyword`.
    pub fn expect_keyword(&self, keyword: &str) -> Result<(), CommandError> {
        if self.keyword != keyword {
            return Err(CommandError::WrongCommand {
                expected: keyword.to_string(),
                found: self.keyword.clone(),
            });
        }
        Ok(())
    }

    /// Arguments from `index` on, joined by single spaces.
    pub fn rest_from(&self, index: usize) -> String {
        self.args.get(index..).unwrap_or_default().join(" ")
    }

    /// Parse argument `index` as a fingerprint.
    pub fn fingerprint_arg(&self, index: usize) -> Result<Fingerprint, CommandError> {
        let raw = self.args.get(index).ok_or_else(|| CommandError::NotEnoughArguments {
            keyword: self.keyword.clone(),
            needed: index + 1,
            got: self.args.len(),
        })?;
        Fingerprint::parse(raw).map_err(|_| CommandError::InvalidFingerprint(raw.clone()))
    }

    pub fn to_payload(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.keyword)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Side effects a handler asks the room to carry out once the state lock
/// is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    PeerAdded(RemoteIdentity),
    PeerRemoved(Fingerprint),
}

pub type CommandResult = Result<Vec<Effect>, CommandError>;

type Handler = Box<dyn Fn(&Command, &Message, &mut RoomState) -> CommandResult + Send + Sync>;

/// Keyword to handler table.
pub struct CommandRegistry {
    handlers: HashMap<String, Handler>,
}

impl CommandRegistry {
    /// An empty registry; every command is rejected as unknown.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// A registry with `invite`, `name_room`, `nick`, `promote` and
    /// `remove_peer`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register(INVITE, handle_invite)
            .register(NAME_ROOM, handle_name_room)
            .register(NICK, handle_nick)
            .register(PROMOTE, handle_promote)
            .register(REMOVE_PEER, handle_remove_peer);
        registry
    }

    /// Register `handler` for `keyword`, replacing any previous one.
    pub fn register<F>(&mut self, keyword: &str, handler: F) -> &mut Self
    where
        F: Fn(&Command, &Message, &mut RoomState) -> CommandResult + Send + Sync + 'static,
    {
        self.handlers.insert(keyword.to_string(), Box::new(handler));
        self
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.handlers.contains_key(keyword)
    }

    pub fn keywords(&self) -> Vec<&str> {
        let mut keywords: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        keywords.sort_unstable();
        keywords
    }

    /// Parse `message` and run the matching handler against `state`.
    pub fn dispatch(&self, message: &Message, state: &mut RoomState) -> CommandResult {
        let command = Command::from_message(message)?;
        let handler = self
            .handlers
            .get(command.keyword())
            .ok_or_else(|| CommandError::UnknownCommand(command.keyword().to_string()))?;
        handler(&command, message, state)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("keywords", &self.keywords())
            .finish()
    }
}

/// `invite <fingerprint>...`: add members. Known members are skipped.
///
/// Every argument is validated before any member is added.
fn handle_invite(command: &Command, _message: &Message, state: &mut RoomState) -> CommandResult {
    command.expect_keyword(INVITE)?;
    command.require_args(1)?;
    let identities = (0..command.args().len())
        .map(|i| {
            let fingerprint = command.fingerprint_arg(i)?;
            RemoteIdentity::from_fingerprint(&fingerprint)
                .map_err(|_| CommandError::InvalidFingerprint(fingerprint.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(identities
        .into_iter()
        .filter(|identity| state.add_peer(identity.clone(), false))
        .map(Effect::PeerAdded)
        .collect())
}

/// `name_room <name...>`
fn handle_name_room(command: &Command, _message: &Message, state: &mut RoomState) -> CommandResult {
    command.expect_keyword(NAME_ROOM)?;
    command.require_args(1)?;
    state.set_name(command.rest_from(0));
    Ok(Vec::new())
}

/// `nick <nickname...>`: renames the sender.
fn handle_nick(command: &Command, message: &Message, state: &mut RoomState) -> CommandResult {
    command.expect_keyword(NICK)?;
    command.require_args(1)?;
    state.set_nickname(&message.sender, command.rest_from(0))?;
    Ok(Vec::new())
}

/// `promote <fingerprint>`: admins only.
fn handle_promote(command: &Command, message: &Message, state: &mut RoomState) -> CommandResult {
    command.expect_keyword(PROMOTE)?;
    command.require_args(1)?;
    if !state.is_admin(&message.sender) {
        return Err(CommandError::NotAdmin(message.sender.to_string()));
    }
    let target = command.fingerprint_arg(0)?;
    state.promote(&target)?;
    Ok(Vec::new())
}

/// `remove_peer <fingerprint>`: admins only.
fn handle_remove_peer(command: &Command, message: &Message, state: &mut RoomState) -> CommandResult {
    command.expect_keyword(REMOVE_PEER)?;
    command.require_args(1)?;
    if !state.is_admin(&message.sender) {
        return Err(CommandError::NotAdmin(message.sender.to_string()));
    }
    let target = command.fingerprint_arg(0)?;
    match state.remove_peer(&target) {
        Some(peer) => Ok(vec![Effect::PeerRemoved(peer.fingerprint().clone())]),
        None => Err(CommandError::PeerNotFound(target.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_shared::{Identity, RoomId, SelfIdentity, Timestamp};

    struct Fixture {
        registry: CommandRegistry,
        me: SelfIdentity,
        state: RoomState,
    }

    impl Fixture {
        fn new() -> Self {
            let me = SelfIdentity::generate();
            let state = RoomState::new(RoomId::new(), me.fingerprint().clone(), true);
            Self {
                registry: CommandRegistry::with_builtins(),
                me,
                state,
            }
        }

        fn run(&mut self, author: &SelfIdentity, text: &str) -> CommandResult {
            let ts = Timestamp::next_after(Timestamp::now());
            let msg = Message::sign(author, ts, ContentType::Command, text.as_bytes().to_vec());
            self.registry.dispatch(&msg, &mut self.state)
        }
    }

    #[test]
    fn test_parse() {
        let cmd = Command::parse("  name_room  the   lobby ").unwrap();
        assert_eq!(cmd.keyword(), "name_room");
        assert_eq!(cmd.args(), &["the".to_string(), "lobby".to_string()]);
        assert_eq!(cmd.rest_from(0), "the lobby");
        assert_eq!(cmd.to_string(), "name_room the lobby");
        assert_eq!(Command::parse("   "), Err(CommandError::Empty));
    }

    #[test]
    fn test_invite_is_idempotent() {
        let mut fx = Fixture::new();
        let me = fx.me.clone();
        let peer = SelfIdentity::generate();
        let text = Command::invite(peer.fingerprint()).to_string();

        let effects = fx.run(&me, &text).unwrap();
        assert_eq!(effects, vec![Effect::PeerAdded(peer.to_remote())]);
        assert!(fx.run(&me, &text).unwrap().is_empty());
        assert_eq!(fx.state.peers().len(), 1);

        let own = Command::invite(me.fingerprint()).to_string();
        assert!(fx.run(&me, &own).unwrap().is_empty());
        assert_eq!(fx.state.peers().len(), 1);
    }

    #[test]
    fn test_invite_several() {
        let mut fx = Fixture::new();
        let me = fx.me.clone();
        let bob = SelfIdentity::generate();
        let carol = SelfIdentity::generate();
        fx.run(&me, &Command::invite(bob.fingerprint()).to_string())
            .unwrap();

        let both = Command::invite_all([bob.fingerprint(), carol.fingerprint()]).to_string();
        let effects = fx.run(&me, &both).unwrap();
        assert_eq!(effects, vec![Effect::PeerAdded(carol.to_remote())]);
        assert_eq!(fx.state.peers().len(), 2);

        let bad = format!("invite {} garbage", SelfIdentity::generate().fingerprint());
        assert!(fx.run(&me, &bad).is_err());
        assert_eq!(fx.state.peers().len(), 2);
    }

    #[test]
    fn test_invite_rejects_garbage() {
        let mut fx = Fixture::new();
        let me = fx.me.clone();
        assert!(matches!(
            fx.run(&me, "invite not-a-fingerprint"),
            Err(CommandError::InvalidFingerprint(_))
        ));
        assert!(matches!(
            fx.run(&me, "invite"),
            Err(CommandError::NotEnoughArguments { needed: 1, got: 0, .. })
        ));
    }

    #[test]
    fn test_unknown_and_wrong_commands() {
        let mut fx = Fixture::new();
        let me = fx.me.clone();
        assert_eq!(
            fx.run(&me, "dance now"),
            Err(CommandError::UnknownCommand("dance".into()))
        );

        let text = Message::sign(&me, Timestamp(1), ContentType::Text, b"nick x".to_vec());
        assert!(matches!(
            fx.registry.dispatch(&text, &mut fx.state),
            Err(CommandError::WrongCommand { .. })
        ));

        let cmd = Command::parse("nick x").unwrap();
        assert!(matches!(
            handle_promote(&cmd, &text, &mut fx.state),
            Err(CommandError::WrongCommand { .. })
        ));
    }

    #[test]
    fn test_nick_applies_to_sender() {
        let mut fx = Fixture::new();
        let me = fx.me.clone();
        let bob = SelfIdentity::generate();
        fx.run(&me, &Command::invite(bob.fingerprint()).to_string())
            .unwrap();

        fx.run(&bob, "nick Bob the Builder").unwrap();
        fx.run(&bob, "nick Bob the Builder").unwrap();
        let peer = fx.state.peer(bob.fingerprint()).unwrap();
        assert_eq!(peer.nickname(), Some("Bob the Builder"));

        fx.run(&me, "nick Alice").unwrap();
        assert_eq!(fx.state.self_nickname(), Some("Alice"));

        let stranger = SelfIdentity::generate();
        assert!(matches!(
            fx.run(&stranger, "nick Eve"),
            Err(CommandError::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_name_room() {
        let mut fx = Fixture::new();
        let me = fx.me.clone();
        fx.run(&me, "name_room Book club").unwrap();
        assert_eq!(fx.state.name(), "Book club");
    }

    #[test]
    fn test_promote_requires_admin() {
        let mut fx = Fixture::new();
        let me = fx.me.clone();
        let bob = SelfIdentity::generate();
        let carol = SelfIdentity::generate();
        fx.run(&me, &Command::invite(bob.fingerprint()).to_string())
            .unwrap();
        fx.run(&me, &Command::invite(carol.fingerprint()).to_string())
            .unwrap();

        let promote_carol = Command::promote(carol.fingerprint()).to_string();
        assert!(matches!(
            fx.run(&bob, &promote_carol),
            Err(CommandError::NotAdmin(_))
        ));
        assert!(!fx.state.is_admin(carol.fingerprint()));

        fx.run(&me, &Command::promote(bob.fingerprint()).to_string())
            .unwrap();
        fx.run(&bob, &promote_carol).unwrap();
        assert!(fx.state.is_admin(carol.fingerprint()));
    }

    #[test]
    fn test_remove_peer() {
        let mut fx = Fixture::new();
        let me = fx.me.clone();
        let bob = SelfIdentity::generate();
        fx.run(&me, &Command::invite(bob.fingerprint()).to_string())
            .unwrap();

        let remove = Command::remove_peer(bob.fingerprint()).to_string();
        assert!(matches!(fx.run(&bob, &remove), Err(CommandError::NotAdmin(_))));

        let effects = fx.run(&me, &remove).unwrap();
        assert_eq!(effects, vec![Effect::PeerRemoved(bob.fingerprint().clone())]);
        assert!(fx.state.peers().is_empty());
        assert!(matches!(
            fx.run(&me, &remove),
            Err(CommandError::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_custom_handler() {
        let mut fx = Fixture::new();
        fx.registry.register("topic", |cmd, _msg, state| {
            cmd.require_args(1)?;
            state.set_name(format!("[{}]", cmd.rest_from(0)));
            Ok(Vec::new())
        });
        let me = fx.me.clone();
        fx.run(&me, "topic rust").unwrap();
        assert_eq!(fx.state.name(), "[rust]");
        assert!(fx.registry.keywords().contains(&"topic"));
    }
}
