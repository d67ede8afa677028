use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use tokio::sync::mpsc;
use tracing::*;

use crate::rcon::sender::Outbound;

#[derive(Debug, Clone)]
pub struct Invoker {
    pub pid: u32,
    pub name: String,
    pub access: i32,
}

/// Where a command's replies go : back to the relay queue that asked, or to
/// the invoking player in game.
#[derive(Clone)]
pub enum ReplySink {
    Queue(mpsc::UnboundedSender<String>),
    Ingame { outbound: Outbound, pid: u32 },
}

impl ReplySink {
    pub fn reply(&self, text: &str) {
        match self {
            ReplySink::Queue(tx) => {
                if tx.send(text.to_string()).is_err() {
                    warn!("Reply queue closed, dropping reply");
                }
            }
            ReplySink::Ingame { outbound, pid } => outbound.host_private_say(*pid, text),
        }
    }
}

/// Per-invocation context. Carries which connection is selected and which is
/// active for the invoking chat context, so no global pointer is needed.
pub struct CommandContext {
    pub selected: String,
    pub active: String,
    pub channel: Option<String>,
    pub channel_type: Option<i32>,
    pub reply: ReplySink,
}

/// Command bodies run inside the tick that received them and must not block.
#[async_trait]
pub trait Command: Send + Sync {
    async fn execute(
        &self,
        router: &CommandRouter,
        ctx: &CommandContext,
        invoker: &Invoker,
        args: &str,
    );
}

struct Registered {
    triggers: Vec<String>,
    access: i32,
    handler: Arc<dyn Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    NotFound,
    Denied,
    Executed,
}

#[derive(Default)]
pub struct CommandRouter {
    commands: Vec<Registered>,
    overrides: HashMap<String, i32>,
}

impl CommandRouter {
    pub fn new(overrides: HashMap<String, i32>) -> CommandRouter {
        CommandRouter { commands: Vec::new(), overrides }
    }

    /// Registers a command under one or more trigger words. A negative
    /// configured access level disables the command here, not at dispatch.
    pub fn register(&mut self, triggers: &[&str], access: i32, handler: Arc<dyn Command>) {
        if access < 0 {
            debug!("Command {:?} disabled by configuration", triggers);
            return;
        }
        self.commands.push(Registered {
            triggers: triggers.iter().map(|t| t.to_lowercase()).collect(),
            access,
            handler,
        });
    }

    /// First registered match wins, exactly the linear-scan semantics the
    /// trigger list always had.
    fn find(&self, word: &str) -> Option<&Registered> {
        self.commands.iter().find(|c| c.triggers.iter().any(|t| t == word))
    }

    /// Access override precedence : specific channel, then channel type,
    /// then global, then the registered default.
    pub fn resolve_access(
        &self,
        trigger: &str,
        channel: Option<&str>,
        channel_type: Option<i32>,
        base: i32,
    ) -> i32 {
        if let Some(channel) = channel {
            if let Some(level) = self.overrides.get(&format!("{}.{}", trigger, channel)) {
                return *level;
            }
        }
        if let Some(channel_type) = channel_type {
            if let Some(level) = self.overrides.get(&format!("{}.type{}", trigger, channel_type)) {
                return *level;
            }
        }
        if let Some(level) = self.overrides.get(trigger) {
            return *level;
        }
        base
    }

    #[instrument(skip(self, ctx), level = "debug")]
    pub async fn trigger(
        &self,
        word: &str,
        invoker: &Invoker,
        args: &str,
        ctx: &CommandContext,
    ) -> TriggerOutcome {
        let word = word.to_lowercase();
        let command = match self.find(&word) {
            Some(command) => command,
            None => return TriggerOutcome::NotFound,
        };
        let needed =
            self.resolve_access(&word, ctx.channel.as_deref(), ctx.channel_type, command.access);
        if invoker.access < needed {
            ctx.reply.reply("Access Denied.");
            return TriggerOutcome::Denied;
        }
        command.handler.execute(self, ctx, invoker, args).await;
        TriggerOutcome::Executed
    }

    /// Trigger words usable at or below the given access level.
    pub fn triggers_for(&self, access: i32) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.access <= access)
            .flat_map(|c| c.triggers.iter().cloned())
            .sorted()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

pub struct HelpCommand;

#[async_trait]
impl Command for HelpCommand {
    async fn execute(
        &self,
        router: &CommandRouter,
        ctx: &CommandContext,
        invoker: &Invoker,
        _args: &str,
    ) {
        let triggers = router.triggers_for(invoker.access).join(", ");
        ctx.reply.reply(&format!("Available commands : {}", triggers));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Recorder(AtomicU32);

    #[async_trait]
    impl Command for Recorder {
        async fn execute(
            &self,
            _router: &CommandRouter,
            ctx: &CommandContext,
            _invoker: &Invoker,
            _args: &str,
        ) {
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.reply.reply("done");
        }
    }

    fn ctx(channel: Option<&str>, channel_type: Option<i32>) -> (CommandContext, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            CommandContext {
                selected: "main".to_string(),
                active: "main".to_string(),
                channel: channel.map(|c| c.to_string()),
                channel_type,
                reply: ReplySink::Queue(tx),
            },
            rx,
        )
    }

    fn invoker(access: i32) -> Invoker {
        Invoker { pid: 7, name: "tester".to_string(), access }
    }

    #[tokio::test]
    async fn first_registered_trigger_wins() {
        let mut router = CommandRouter::new(HashMap::new());
        let first = Arc::new(Recorder(AtomicU32::new(0)));
        let second = Arc::new(Recorder(AtomicU32::new(0)));
        router.register(&["kick", "boot"], 0, first.clone());
        router.register(&["kick"], 0, second.clone());

        let (ctx, _rx) = ctx(None, None);
        assert_eq!(router.trigger("KICK", &invoker(0), "", &ctx).await, TriggerOutcome::Executed);
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
        assert_eq!(router.trigger("boot", &invoker(0), "", &ctx).await, TriggerOutcome::Executed);
        assert_eq!(first.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn negative_access_disables_at_registration() {
        let mut router = CommandRouter::new(HashMap::new());
        router.register(&["secret"], -1, Arc::new(Recorder(AtomicU32::new(0))));
        assert!(router.is_empty());
        let (ctx, _rx) = ctx(None, None);
        assert_eq!(
            router.trigger("secret", &invoker(100), "", &ctx).await,
            TriggerOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn denied_reply_goes_to_the_invoker() {
        let mut router = CommandRouter::new(HashMap::new());
        router.register(&["kick"], 3, Arc::new(Recorder(AtomicU32::new(0))));
        let (ctx, mut rx) = ctx(None, None);
        assert_eq!(router.trigger("kick", &invoker(1), "", &ctx).await, TriggerOutcome::Denied);
        assert_eq!(rx.try_recv().unwrap(), "Access Denied.");
    }

    #[tokio::test]
    async fn override_precedence_specific_channel_first() {
        let mut overrides = HashMap::new();
        overrides.insert("kick".to_string(), 1);
        overrides.insert("kick.type0".to_string(), 2);
        overrides.insert("kick.#admin".to_string(), 4);
        let mut router = CommandRouter::new(overrides);
        router.register(&["kick"], 0, Arc::new(Recorder(AtomicU32::new(0))));

        //access 3 in #admin needs 4 : denied
        let (admin_ctx, _rx) = ctx(Some("#admin"), Some(0));
        assert_eq!(
            router.trigger("kick", &invoker(3), "", &admin_ctx).await,
            TriggerOutcome::Denied
        );
        //the same player in another type 0 channel needs 2 : allowed
        let (typed_ctx, _rx) = ctx(Some("#other"), Some(0));
        assert_eq!(
            router.trigger("kick", &invoker(3), "", &typed_ctx).await,
            TriggerOutcome::Executed
        );
        //no channel context falls back to the global override
        assert_eq!(router.resolve_access("kick", None, None, 0), 1);
    }

    #[tokio::test]
    async fn help_lists_reachable_triggers() {
        let mut router = CommandRouter::new(HashMap::new());
        router.register(&["help"], 0, Arc::new(HelpCommand));
        router.register(&["kick"], 2, Arc::new(Recorder(AtomicU32::new(0))));
        let (ctx, mut rx) = ctx(None, None);
        router.trigger("help", &invoker(0), "", &ctx).await;
        let reply = rx.try_recv().unwrap();
        assert!(reply.contains("help"));
        assert!(!reply.contains("kick"));
    }
}
