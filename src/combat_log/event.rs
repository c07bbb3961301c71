use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::context::{ParserContext, UNKNOWN};

/// ISK per repaired hit point, in hundredths.
const SHIELD_RATE_HUNDREDTHS: u64 = 8;
const ARMOR_RATE_HUNDREDTHS: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepairKind {
    Shield,
    Armor,
}

impl RepairKind {
    /// Case-insensitive; anything but `shield`/`armor` is rejected.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        if keyword.eq_ignore_ascii_case("shield") {
            Some(Self::Shield)
        } else if keyword.eq_ignore_ascii_case("armor") {
            Some(Self::Armor)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shield => "Shield",
            Self::Armor => "Armor",
        }
    }

    fn rate_hundredths(self) -> u64 {
        match self {
            Self::Shield => SHIELD_RATE_HUNDREDTHS,
            Self::Armor => ARMOR_RATE_HUNDREDTHS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
    #[serde(rename = "Self")]
    SelfRepair,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outgoing => "Outgoing",
            Self::Incoming => "Incoming",
            Self::SelfRepair => "Self",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairEvent {
    pub timestamp: NaiveDateTime,
    pub target_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_corporation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_alliance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_ship_type: Option<String>,
    pub repair_type: RepairKind,
    pub amount: u32,
    pub logi_pilot: String,
    pub repair_module: String,
    pub system_name: String,
    pub system_security: String,
    pub isk_value: f64,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_to_target: Option<f64>,
}

impl RepairEvent {
    /// Value in hundredths of ISK, exact for any value produced by [`repair_value`].
    pub fn value_hundredths(&self) -> u64 {
        (self.isk_value * 100.0).round() as u64
    }
}

/// `round(amount * rate, 2)`. Both rates have two decimals, so the product
/// in hundredths is already exact.
pub fn repair_value(amount: u32, kind: RepairKind) -> f64 {
    let hundredths = u64::from(amount) * kind.rate_hundredths();
    hundredths as f64 / 100.0
}

/// A classified repair line, before identities are resolved against context.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairMatch {
    pub timestamp: NaiveDateTime,
    pub direction: Direction,
    pub kind: RepairKind,
    pub amount: u32,
    /// The other pilot on the line: target for outgoing, actor for incoming.
    pub counterpart: Option<String>,
    pub module: String,
    pub system: Option<String>,
}

pub fn build_repair_event(repair: RepairMatch, context: &ParserContext) -> RepairEvent {
    let character = context.character_or_unknown().to_string();
    let counterpart = repair
        .counterpart
        .unwrap_or_else(|| UNKNOWN.to_string());

    let (target_name, logi_pilot) = match repair.direction {
        Direction::Outgoing => (counterpart, character),
        Direction::Incoming => (character, counterpart),
        Direction::SelfRepair => (character.clone(), character),
    };

    let system_name = repair
        .system
        .unwrap_or_else(|| context.system_name().to_string());

    RepairEvent {
        timestamp: repair.timestamp,
        target_name,
        target_corporation: None,
        target_alliance: None,
        target_ship_type: None,
        repair_type: repair.kind,
        amount: repair.amount,
        logi_pilot,
        repair_module: repair.module,
        system_name,
        system_security: context.system_security().to_string(),
        isk_value: repair_value(repair.amount, repair.kind),
        direction: repair.direction,
        distance_to_target: None,
    }
}
