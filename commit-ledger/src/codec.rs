//! Wire formats for proofs, approvals and fills
//!
//! Domain types stay free of transport concerns; each has a separate wire
//! struct (camelCase JSON, amounts as decimal strings so they survive
//! clients without 128-bit integers) and a [`WireFormat`] impl converting
//! between the two.

use crate::solvency::{Liability, Proof};
use crate::types::{Address, Amount, Approval, AssetAmount, Digest, Fill, Intent, Round};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversion between a domain type and its wire representation
pub trait WireFormat: Sized {
    /// Wire representation
    type Wire: Serialize + DeserializeOwned;

    /// Convert to the wire representation
    fn to_wire_format(&self) -> Self::Wire;

    /// Parse from the wire representation
    fn from_wire_format(wire: Self::Wire) -> Result<Self>;

    /// Serialize straight to JSON
    fn to_wire_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_wire_format())?)
    }

    /// Parse straight from JSON
    fn from_wire_json(json: &str) -> Result<Self> {
        Self::from_wire_format(serde_json::from_str(json)?)
    }
}

fn parse_amount(field: &str, value: &str) -> Result<Amount> {
    value
        .parse::<Amount>()
        .map_err(|e| Error::InvalidEncoding(format!("{} {:?} is not an integer amount: {}", field, value, e)))
}

/// Proof on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofWire {
    /// Sibling hashes, leaf to root
    pub hashes: Vec<Digest>,
    /// Sibling sums, same order as `hashes`
    pub sums: Vec<String>,
    /// Tree height
    pub height: u64,
    /// Tree width
    pub width: u64,
    /// Round
    pub round: Round,
    /// Claimant opening balance
    pub client_opening_balance: String,
    /// Claimant wallet
    pub client_address: Address,
    /// Token
    pub token_address: Address,
}

impl WireFormat for Proof {
    type Wire = ProofWire;

    fn to_wire_format(&self) -> ProofWire {
        ProofWire {
            hashes: self.liabilities.iter().map(|l| l.hash).collect(),
            sums: self.liabilities.iter().map(|l| l.sum.to_string()).collect(),
            height: self.height,
            width: self.width,
            round: self.round,
            client_opening_balance: self.client_opening_balance.to_string(),
            client_address: self.client_address,
            token_address: self.token_address,
        }
    }

    fn from_wire_format(wire: ProofWire) -> Result<Self> {
        if wire.hashes.len() != wire.sums.len() {
            return Err(Error::InvalidEncoding(format!(
                "proof has {} hashes but {} sums",
                wire.hashes.len(),
                wire.sums.len()
            )));
        }

        let liabilities = wire
            .hashes
            .into_iter()
            .zip(wire.sums.iter())
            .map(|(hash, sum)| Ok(Liability { hash, sum: parse_amount("sum", sum)? }))
            .collect::<Result<Vec<_>>>()?;

        Ok(Proof {
            liabilities,
            height: wire.height,
            width: wire.width,
            round: wire.round,
            client_opening_balance: parse_amount("clientOpeningBalance", &wire.client_opening_balance)?,
            client_address: wire.client_address,
            token_address: wire.token_address,
        })
    }
}

/// One side of an approval on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmountWire {
    /// Token
    pub asset: Address,
    /// Amount as a decimal string
    pub amount: String,
}

/// Approval on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalWire {
    /// Approval ID
    pub approval_id: Uuid,
    /// Round
    pub round: Round,
    /// Buy side
    pub buy: AssetAmountWire,
    /// Sell side
    pub sell: AssetAmountWire,
    /// `buyAll` or `sellAll`
    pub intent: Intent,
    /// Owner wallet
    pub owner: Address,
    /// Mediator instance
    pub instance_id: Address,
}

impl WireFormat for Approval {
    type Wire = ApprovalWire;

    fn to_wire_format(&self) -> ApprovalWire {
        let side = |s: &AssetAmount| AssetAmountWire {
            asset: s.asset,
            amount: s.amount.to_string(),
        };
        ApprovalWire {
            approval_id: self.approval_id,
            round: self.round,
            buy: side(&self.buy),
            sell: side(&self.sell),
            intent: self.intent,
            owner: self.owner,
            instance_id: self.instance_id,
        }
    }

    fn from_wire_format(wire: ApprovalWire) -> Result<Self> {
        Ok(Approval {
            approval_id: wire.approval_id,
            round: wire.round,
            buy: AssetAmount {
                asset: wire.buy.asset,
                amount: parse_amount("buy.amount", &wire.buy.amount)?,
            },
            sell: AssetAmount {
                asset: wire.sell.asset,
                amount: parse_amount("sell.amount", &wire.sell.amount)?,
            },
            intent: wire.intent,
            owner: wire.owner,
            instance_id: wire.instance_id,
        })
    }
}

/// Fill on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillWire {
    /// Fill ID
    pub fill_id: Uuid,
    /// Backing approval
    pub approval_id: Uuid,
    /// Round
    pub round: Round,
    /// Amount received
    pub buy_amount: String,
    /// Asset received
    pub buy_asset: Address,
    /// Amount given
    pub sell_amount: String,
    /// Asset given
    pub sell_asset: Address,
    /// Client wallet
    pub client_address: Address,
    /// Mediator instance
    pub instance_id: Address,
}

impl WireFormat for Fill {
    type Wire = FillWire;

    fn to_wire_format(&self) -> FillWire {
        FillWire {
            fill_id: self.fill_id,
            approval_id: self.approval_id,
            round: self.round,
            buy_amount: self.buy_amount.to_string(),
            buy_asset: self.buy_asset,
            sell_amount: self.sell_amount.to_string(),
            sell_asset: self.sell_asset,
            client_address: self.client_address,
            instance_id: self.instance_id,
        }
    }

    fn from_wire_format(wire: FillWire) -> Result<Self> {
        Ok(Fill {
            fill_id: wire.fill_id,
            approval_id: wire.approval_id,
            round: wire.round,
            buy_amount: parse_amount("buyAmount", &wire.buy_amount)?,
            buy_asset: wire.buy_asset,
            sell_amount: parse_amount("sellAmount", &wire.sell_amount)?,
            sell_asset: wire.sell_asset,
            client_address: wire.client_address,
            instance_id: wire.instance_id,
        })
    }
}
