//! # Command Synthesizer
//!
//! Turns one logical world edit into the sequence of console commands that
//! carries it out, and owns everything stateful about talking to the server.
//!
//! ## Connection state machine:
//! ```text
//! Disconnected --connect ok--> Connected
//! Connected --command fails--> Disconnected --reconnect ok--> retry once
//! ```
//! A command that fails, reconnects and fails again is reported, never retried further.
//!
//! ## Cooldown:
//! Keyed by speaker (or one global key). Checked and recorded once per
//! logical operation; the individual slab and `list` calls inside an
//! operation never consult it. A request inside the window is refused
//! without touching the connection.
//!
//! ## Player fan-out:
//! The player list is fetched fresh for every operation. Players run one
//! after another; a failed slab stops the remaining slabs for that player only.

use crate::commands::plan::{
    parse_player_list, place_span, plan_slabs, say_command, CommandPlan, VerticalSpan,
};
use crate::commands::rcon::RemoteConsole;
use crate::config::CommandsConfig;
use crate::error::AppResult;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Who a cooldown applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CooldownKey {
    Global,
    Speaker(u64),
}

impl CooldownKey {
    /// Per-speaker key when enabled and the speaker is known, otherwise global.
    pub fn for_speaker(speaker_id: Option<u64>, per_speaker: bool) -> Self {
        match speaker_id {
            Some(id) if per_speaker => CooldownKey::Speaker(id),
            _ => CooldownKey::Global,
        }
    }
}

impl fmt::Display for CooldownKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CooldownKey::Global => write!(f, "global"),
            CooldownKey::Speaker(id) => write!(f, "speaker_{}", id),
        }
    }
}

/// Result of a cooldown-gated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gated<T> {
    Ran(T),
    CooledDown { remaining: Duration },
}

/// Player name to "every command for this player succeeded".
pub type PlayerResults = BTreeMap<String, bool>;

/// Edit geometry and limits, taken from the `commands` config section.
#[derive(Debug, Clone)]
pub struct SynthesizerSettings {
    pub replacement_block: String,
    pub chunk_radius: u32,
    pub world_span: VerticalSpan,
    pub block_ceiling: u64,
    pub max_radius: u32,
    pub cooldown: Duration,
}

impl From<&CommandsConfig> for SynthesizerSettings {
    fn from(config: &CommandsConfig) -> Self {
        Self {
            replacement_block: config.replacement_block.clone(),
            chunk_radius: config.chunk_radius,
            world_span: VerticalSpan::absolute(config.world_min_y, config.world_max_y),
            block_ceiling: config.block_ceiling,
            max_radius: config.max_radius,
            cooldown: Duration::from_secs(config.cooldown_seconds),
        }
    }
}

/// Snapshot for the `status` command and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizerStatus {
    pub state: ConnectionState,
    pub reconnects: u64,
    /// Keys still cooling down, with the time left
    pub cooldowns: Vec<(CooldownKey, Duration)>,
}

pub struct CommandSynthesizer {
    console: Box<dyn RemoteConsole>,
    state: ConnectionState,
    reconnects: u64,
    cooldowns: HashMap<CooldownKey, Instant>,
    settings: SynthesizerSettings,
}

impl CommandSynthesizer {
    pub fn new(console: Box<dyn RemoteConsole>, settings: SynthesizerSettings) -> Self {
        Self {
            console,
            state: ConnectionState::Disconnected,
            reconnects: 0,
            cooldowns: HashMap::new(),
            settings,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn settings(&self) -> &SynthesizerSettings {
        &self.settings
    }

    /// Connect if not already connected.
    pub async fn connect(&mut self) -> AppResult<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        match self.console.connect().await {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("RCON connection failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn disconnect(&mut self) {
        self.console.disconnect().await;
        self.state = ConnectionState::Disconnected;
    }

    /// Run one command, reconnecting and retrying exactly once on failure.
    ///
    /// Cooldown is not consulted here.
    pub async fn execute(&mut self, command: &str) -> AppResult<String> {
        self.connect().await?;

        let first_error = match self.console.execute(command).await {
            Ok(reply) => {
                tracing::debug!("RCON: {} -> {}", command, reply);
                return Ok(reply);
            }
            Err(e) => e,
        };

        tracing::warn!("Command failed, reconnecting: {}", first_error);
        self.state = ConnectionState::Disconnected;
        self.reconnects += 1;
        self.connect().await?;

        match self.console.execute(command).await {
            Ok(reply) => {
                tracing::debug!("RCON (retry): {} -> {}", command, reply);
                Ok(reply)
            }
            Err(e) => {
                tracing::error!("Command failed after reconnect: {}", e);
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Whether the server answers a trivial command.
    pub async fn test_connection(&mut self) -> bool {
        self.execute("list").await.is_ok()
    }

    /// Currently online players, fetched fresh.
    ///
    /// A reply that cannot be parsed counts as nobody online.
    pub async fn online_players(&mut self) -> AppResult<Vec<String>> {
        let reply = self.execute("list").await?;
        match parse_player_list(&reply) {
            Ok(players) => Ok(players),
            Err(e) => {
                tracing::warn!("{}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Time left on `key`'s cooldown, or `None` when it may run.
    pub fn cooldown_remaining(&self, key: CooldownKey) -> Option<Duration> {
        let last = self.cooldowns.get(&key)?;
        let elapsed = last.elapsed();
        if elapsed >= self.settings.cooldown {
            None
        } else {
            Some(self.settings.cooldown - elapsed)
        }
    }

    fn record_cooldown(&mut self, key: CooldownKey) {
        self.cooldowns.insert(key, Instant::now());
    }

    /// Replace every `target_block` with the replacement block in the chunk
    /// column around each online player.
    pub async fn clear_around_all_players(
        &mut self,
        target_block: &str,
        key: CooldownKey,
    ) -> AppResult<Gated<PlayerResults>> {
        if let Some(remaining) = self.cooldown_remaining(key) {
            tracing::info!("Clear for {} refused, cooldown {:?} left", key, remaining);
            return Ok(Gated::CooledDown { remaining });
        }

        let plan = plan_slabs(
            self.settings.chunk_radius,
            self.settings.world_span,
            self.settings.block_ceiling,
        )?;
        let replacement = self.settings.replacement_block.clone();
        let results = self.fan_out(&plan, &replacement, target_block).await?;
        self.record_cooldown(key);

        tracing::info!(
            "Cleared {} around {} player(s) in {} slab(s) each",
            target_block,
            results.len(),
            plan.slabs.len()
        );
        Ok(Gated::Ran(results))
    }

    /// Fill a cube of `radius` around each online player with `block`,
    /// replacing only the replacement block (air by default).
    pub async fn place_around_all_players(
        &mut self,
        block: &str,
        radius: u32,
        key: CooldownKey,
    ) -> AppResult<Gated<PlayerResults>> {
        if let Some(remaining) = self.cooldown_remaining(key) {
            tracing::info!("Place for {} refused, cooldown {:?} left", key, remaining);
            return Ok(Gated::CooledDown { remaining });
        }

        let radius = radius.min(self.settings.max_radius);
        let plan = plan_slabs(radius, place_span(radius), self.settings.block_ceiling)?;
        let replacement = self.settings.replacement_block.clone();
        let results = self.fan_out(&plan, block, &replacement).await?;
        self.record_cooldown(key);
        Ok(Gated::Ran(results))
    }

    /// Broadcast a chat message.
    pub async fn say(&mut self, message: &str, key: CooldownKey) -> AppResult<Gated<String>> {
        if let Some(remaining) = self.cooldown_remaining(key) {
            return Ok(Gated::CooledDown { remaining });
        }
        let reply = self.execute(&say_command(message)).await?;
        self.record_cooldown(key);
        Ok(Gated::Ran(reply))
    }

    pub fn status(&self) -> SynthesizerStatus {
        let mut cooldowns: Vec<(CooldownKey, Duration)> = self
            .cooldowns
            .keys()
            .filter_map(|&key| self.cooldown_remaining(key).map(|left| (key, left)))
            .collect();
        cooldowns.sort();
        SynthesizerStatus {
            state: self.state,
            reconnects: self.reconnects,
            cooldowns,
        }
    }

    async fn fan_out(&mut self, plan: &CommandPlan, block: &str, replace: &str) -> AppResult<PlayerResults> {
        let players = self.online_players().await?;
        if players.is_empty() {
            tracing::info!("No players online, nothing to edit");
        }

        let mut results = PlayerResults::new();
        for player in players {
            let mut ok = true;
            for command in plan.commands(&player, block, replace) {
                if let Err(e) = self.execute(&command).await {
                    tracing::warn!("Edit around {} aborted: {}", player, e);
                    ok = false;
                    break;
                }
            }
            results.insert(player, ok);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BotError;
    use crate::test_helpers::FakeConsole;

    fn settings() -> SynthesizerSettings {
        let mut config = crate::config::AppConfig::default().commands;
        config.cooldown_seconds = 5;
        SynthesizerSettings::from(&config)
    }

    fn synthesizer(console: FakeConsole) -> CommandSynthesizer {
        CommandSynthesizer::new(Box::new(console), settings())
    }

    #[tokio::test]
    async fn test_retry_after_single_failure() {
        let console = FakeConsole::with_players(&["Alice"]).failing_commands(1);
        let log = console.log();
        let mut synth = synthesizer(console);

        assert_eq!(synth.execute("say hi").await.unwrap(), "ok");
        assert_eq!(synth.reconnects(), 1);
        assert_eq!(synth.state(), ConnectionState::Connected);
        // initial connect plus exactly one reconnect
        assert_eq!(log.lock().connects, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_one_retry() {
        let console = FakeConsole::with_players(&["Alice"]).failing_commands(2);
        let log = console.log();
        let mut synth = synthesizer(console);

        assert!(synth.execute("say hi").await.is_err());
        assert_eq!(synth.reconnects(), 1);
        assert_eq!(synth.state(), ConnectionState::Disconnected);
        assert_eq!(log.lock().attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_reconnect_is_reported() {
        let console = FakeConsole::with_players(&["Alice"])
            .failing_commands(1)
            .failing_connects_after(1);
        let mut synth = synthesizer(console);

        assert!(matches!(synth.execute("list").await, Err(BotError::Connection(_))));
        assert_eq!(synth.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_then_expires() {
        let console = FakeConsole::with_players(&["Alice"]);
        let log = console.log();
        let mut synth = synthesizer(console);
        let key = CooldownKey::Speaker(1);

        assert!(matches!(synth.say("one", key).await.unwrap(), Gated::Ran(_)));
        let calls_after_first = log.lock().attempts.len();

        tokio::time::advance(Duration::from_secs(2)).await;
        match synth.say("two", key).await.unwrap() {
            Gated::CooledDown { remaining } => assert_eq!(remaining, Duration::from_secs(3)),
            other => panic!("expected cooldown, got {:?}", other),
        }
        assert_eq!(log.lock().attempts.len(), calls_after_first);

        // Other speakers are unaffected
        assert!(matches!(synth.say("other", CooldownKey::Speaker(2)).await.unwrap(), Gated::Ran(_)));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(matches!(synth.say("three", key).await.unwrap(), Gated::Ran(_)));
    }

    #[tokio::test]
    async fn test_clear_fans_out_slabs_per_player() {
        let console = FakeConsole::with_players(&["Alice", "Bob"]);
        let log = console.log();
        let mut synth = synthesizer(console);

        let results = synth
            .clear_around_all_players("minecraft:stone", CooldownKey::Global)
            .await
            .unwrap();
        let expected: PlayerResults = [("Alice".to_string(), true), ("Bob".to_string(), true)].into();
        assert_eq!(results, Gated::Ran(expected));

        let fills: Vec<String> = log.lock().fills();
        assert_eq!(fills.len(), 8);
        assert_eq!(
            fills[0],
            "execute as Alice at @s run fill ~-8 -64 ~-8 ~8 48 ~8 minecraft:air replace minecraft:stone"
        );
        assert!(fills[4].starts_with("execute as Bob"));
        assert!(fills[7].contains(" 275 ") && fills[7].contains(" 320 "));
    }

    #[tokio::test]
    async fn test_failing_slab_only_aborts_that_player() {
        // Every command mentioning Alice fails, including the retry
        let console = FakeConsole::with_players(&["Alice", "Bob"]).failing_matching("as Alice");
        let log = console.log();
        let mut synth = synthesizer(console);

        let results = synth
            .clear_around_all_players("minecraft:dirt", CooldownKey::Global)
            .await
            .unwrap();
        let expected: PlayerResults = [("Alice".to_string(), false), ("Bob".to_string(), true)].into();
        assert_eq!(results, Gated::Ran(expected));

        let log = log.lock();
        // Alice: first slab tried twice, then aborted
        assert_eq!(log.attempts.iter().filter(|c| c.contains("as Alice")).count(), 2);
        assert_eq!(log.fills().iter().filter(|c| c.contains("as Bob")).count(), 4);
    }

    #[tokio::test]
    async fn test_place_clamps_radius_and_uses_single_command() {
        let console = FakeConsole::with_players(&["Steve"]);
        let log = console.log();
        let mut synth = synthesizer(console);

        synth
            .place_around_all_players("minecraft:gold_block", 50, CooldownKey::Global)
            .await
            .unwrap();
        assert_eq!(
            log.lock().fills(),
            vec!["execute as Steve at @s run fill ~-10 ~-1 ~-10 ~10 ~10 ~10 minecraft:gold_block replace minecraft:air"]
        );
    }

    #[tokio::test]
    async fn test_unparseable_player_list_is_empty() {
        let console = FakeConsole::with_list_reply("Unknown command");
        let mut synth = synthesizer(console);
        assert!(synth.online_players().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_active_cooldowns() {
        let mut synth = synthesizer(FakeConsole::with_players(&[]));
        synth.say("hello", CooldownKey::Global).await.unwrap();

        let status = synth.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.cooldowns, vec![(CooldownKey::Global, Duration::from_secs(5))]);

        synth.disconnect().await;
        assert_eq!(synth.state(), ConnectionState::Disconnected);
    }
}
