//! Vault registry.
//!
//! Each vault names its ERC-4626 contract, whether deposits are open yet,
//! and which settlement strategy moves XRP into it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, SettlementError};
use crate::types::SettlementKind;
use crate::xrpl::address::is_valid_classic_address;

fn default_available() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    pub id: String,
    pub name: String,
    /// ERC-4626 vault contract on the execution chain
    pub vault_address: String,
    pub settlement: SettlementKind,
    /// XRPL address receiving payments for escrow-settled vaults
    #[serde(default)]
    pub escrow_address: Option<String>,
    #[serde(default = "default_available")]
    pub available: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VaultRegistry {
    vaults: HashMap<String, VaultConfig>,
}

impl VaultRegistry {
    pub fn new(vaults: Vec<VaultConfig>) -> Result<Self> {
        let mut map = HashMap::with_capacity(vaults.len());
        for vault in vaults {
            if vault.id.trim().is_empty() {
                return Err(SettlementError::validation("vault id cannot be empty"));
            }
            if vault.vault_address.len() != 42 || !vault.vault_address.starts_with("0x") {
                return Err(SettlementError::validation(format!(
                    "vault {} has an invalid vaultAddress",
                    vault.id
                )));
            }
            if vault.settlement == SettlementKind::Escrow {
                match vault.escrow_address.as_deref() {
                    Some(addr) if is_valid_classic_address(addr) => {}
                    _ => {
                        return Err(SettlementError::validation(format!(
                            "escrow vault {} requires a valid escrowAddress",
                            vault.id
                        )))
                    }
                }
            }
            if map.contains_key(&vault.id) {
                return Err(SettlementError::validation(format!(
                    "duplicate vault id {}",
                    vault.id
                )));
            }
            map.insert(vault.id.clone(), vault);
        }
        Ok(Self { vaults: map })
    }

    /// Parse the JSON array carried by `VAULTS_CONFIG`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let vaults: Vec<VaultConfig> = serde_json::from_str(raw)
            .map_err(|e| SettlementError::validation(format!("invalid vault config: {}", e)))?;
        Self::new(vaults)
    }

    pub fn get(&self, id: &str) -> Result<&VaultConfig> {
        self.vaults
            .get(id)
            .ok_or_else(|| SettlementError::validation(format!("unknown vault {}", id)))
    }

    /// Vault that accepts new deposits.
    pub fn require_available(&self, id: &str) -> Result<&VaultConfig> {
        let vault = self.get(id)?;
        if !vault.available {
            return Err(SettlementError::validation(format!(
                "vault {} is not yet available for deposits",
                id
            )));
        }
        Ok(vault)
    }

    pub fn list(&self) -> Vec<&VaultConfig> {
        let mut vaults: Vec<_> = self.vaults.values().collect();
        vaults.sort_by(|a, b| a.id.cmp(&b.id));
        vaults
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"[
        {"id": "fxrp-yield", "name": "FXRP Yield", "vaultAddress": "0x00000000000000000000000000000000000000a1", "settlement": "attested_mint"},
        {"id": "xrp-escrow", "name": "XRP Escrow", "vaultAddress": "0x00000000000000000000000000000000000000a2", "settlement": "escrow", "escrowAddress": "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh"},
        {"id": "soon", "name": "Coming Soon", "vaultAddress": "0x00000000000000000000000000000000000000a3", "settlement": "attested_mint", "available": false}
    ]"#;

    #[test]
    fn test_parse_registry() {
        let registry = VaultRegistry::from_json(CONFIG).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.get("xrp-escrow").unwrap().settlement,
            SettlementKind::Escrow
        );
        assert!(registry.get("fxrp-yield").unwrap().available);
        assert_eq!(registry.list()[0].id, "fxrp-yield");
    }

    #[test]
    fn test_unavailable_vault_rejected() {
        let registry = VaultRegistry::from_json(CONFIG).unwrap();
        let err = registry.require_available("soon").unwrap_err();
        assert!(err.to_string().contains("not yet available"));
        assert!(registry.require_available("missing").is_err());
    }

    #[test]
    fn test_escrow_requires_address() {
        let raw = r#"[{"id": "e", "name": "E", "vaultAddress": "0x00000000000000000000000000000000000000a2", "settlement": "escrow"}]"#;
        assert!(VaultRegistry::from_json(raw).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let raw = r#"[
            {"id": "a", "name": "A", "vaultAddress": "0x00000000000000000000000000000000000000a1", "settlement": "attested_mint"},
            {"id": "a", "name": "A2", "vaultAddress": "0x00000000000000000000000000000000000000a2", "settlement": "attested_mint"}
        ]"#;
        let err = VaultRegistry::from_json(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
