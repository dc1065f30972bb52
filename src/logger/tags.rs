/// Log tags identifying the subsystem a message originates from
use colored::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogTag {
    System,
    Db,
    Settings,
    Budget,
    Oracle,
    Ledger,
    Webhook,
    Poller,
    Pnl,
    Reconcile,
    Gate,
    Webserver,
}

impl LogTag {
    /// Plain uppercase name used in file output and alignment
    pub fn to_plain_string(&self) -> &'static str {
        match self {
            LogTag::System => "SYSTEM",
            LogTag::Db => "DB",
            LogTag::Settings => "SETTINGS",
            LogTag::Budget => "BUDGET",
            LogTag::Oracle => "ORACLE",
            LogTag::Ledger => "LEDGER",
            LogTag::Webhook => "WEBHOOK",
            LogTag::Poller => "POLLER",
            LogTag::Pnl => "PNL",
            LogTag::Reconcile => "RECONCILE",
            LogTag::Gate => "GATE",
            LogTag::Webserver => "WEB",
        }
    }

    /// Key used to match --debug-<module> flags
    pub fn to_debug_key(&self) -> &'static str {
        match self {
            LogTag::System => "system",
            LogTag::Db => "db",
            LogTag::Settings => "settings",
            LogTag::Budget => "budget",
            LogTag::Oracle => "oracle",
            LogTag::Ledger => "ledger",
            LogTag::Webhook => "webhook",
            LogTag::Poller => "poller",
            LogTag::Pnl => "pnl",
            LogTag::Reconcile => "reconcile",
            LogTag::Gate => "gate",
            LogTag::Webserver => "webserver",
        }
    }

    /// Colored representation for console output
    pub fn to_colored_string(&self) -> ColoredString {
        match self {
            LogTag::System => self.to_plain_string().bright_white(),
            LogTag::Db => self.to_plain_string().bright_black(),
            LogTag::Settings => self.to_plain_string().cyan(),
            LogTag::Budget => self.to_plain_string().yellow(),
            LogTag::Oracle => self.to_plain_string().magenta(),
            LogTag::Ledger => self.to_plain_string().green(),
            LogTag::Webhook => self.to_plain_string().bright_blue(),
            LogTag::Poller => self.to_plain_string().blue(),
            LogTag::Pnl => self.to_plain_string().bright_green(),
            LogTag::Reconcile => self.to_plain_string().bright_magenta(),
            LogTag::Gate => self.to_plain_string().bright_cyan(),
            LogTag::Webserver => self.to_plain_string().white(),
        }
    }
}
