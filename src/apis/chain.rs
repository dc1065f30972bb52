/// Chain data provider client (balances + parsed transaction history)
///
/// Both calls consume tracking credits; callers reserve them through the
/// budget module before invoking anything here.
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const TIMEOUT_SECS: u64 = 15;

/// One parsed token transfer from the provider's enhanced transaction feed,
/// with the counterpart native-asset movement seen by the same wallet.
#[derive(Debug, Clone)]
pub struct ParsedTransfer {
    pub signature: String,
    pub timestamp: Option<i64>,
    pub mint: String,
    pub from_wallet: Option<String>,
    pub to_wallet: Option<String>,
    pub token_amount: f64,
    /// Native asset received by the transfer source in the same transaction
    /// (sell proceeds); None when the provider did not expose it
    pub counterpart_sol: Option<f64>,
}

#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Current token balance held by a wallet (UI units)
    async fn get_token_balance(&self, wallet_address: &str, token_address: &str)
        -> Result<f64, String>;

    /// Recent parsed transfers involving the wallet, newest first, bounded by `limit`
    async fn get_recent_transfers(
        &self,
        wallet_address: &str,
        limit: u32,
    ) -> Result<Vec<ParsedTransfer>, String>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mock chain API: fixed balance table keyed by "{wallet}:{token}" and
    /// a canned transfer history per wallet. Unknown wallets error, which
    /// doubles as the transient-failure case.
    #[derive(Default)]
    pub struct MockChainApi {
        pub balances: Mutex<HashMap<String, f64>>,
        pub transfers: Mutex<HashMap<String, Vec<ParsedTransfer>>>,
    }

    impl MockChainApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_balance(&self, wallet: &str, token: &str, balance: f64) {
            self.balances
                .lock()
                .unwrap()
                .insert(format!("{}:{}", wallet, token), balance);
        }

        pub fn set_transfers(&self, wallet: &str, transfers: Vec<ParsedTransfer>) {
            self.transfers
                .lock()
                .unwrap()
                .insert(wallet.to_string(), transfers);
        }
    }

    #[async_trait]
    impl ChainApi for MockChainApi {
        async fn get_token_balance(
            &self,
            wallet_address: &str,
            token_address: &str,
        ) -> Result<f64, String> {
            self.balances
                .lock()
                .unwrap()
                .get(&format!("{}:{}", wallet_address, token_address))
                .copied()
                .ok_or_else(|| format!("mock: no balance for {}", wallet_address))
        }

        async fn get_recent_transfers(
            &self,
            wallet_address: &str,
            limit: u32,
        ) -> Result<Vec<ParsedTransfer>, String> {
            let transfers = self
                .transfers
                .lock()
                .unwrap()
                .get(wallet_address)
                .cloned()
                .ok_or_else(|| format!("mock: no history for {}", wallet_address))?;
            Ok(transfers.into_iter().take(limit as usize).collect())
        }
    }
}

pub struct HttpChainApi {
    client: Client,
    rpc_url: String,
    enhanced_base_url: String,
    api_key: String,
}

impl HttpChainApi {
    pub fn new(rpc_url: &str, enhanced_base_url: &str, api_key: &str) -> Self {
        Self {
            client: Client::new(),
            rpc_url: rpc_url.trim_end_matches('/').to_string(),
            enhanced_base_url: enhanced_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<RpcResult>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResult {
    value: Vec<RpcTokenAccount>,
}

#[derive(Debug, Deserialize)]
struct RpcTokenAccount {
    account: RpcAccount,
}

#[derive(Debug, Deserialize)]
struct RpcAccount {
    data: RpcAccountData,
}

#[derive(Debug, Deserialize)]
struct RpcAccountData {
    parsed: RpcParsed,
}

#[derive(Debug, Deserialize)]
struct RpcParsed {
    info: RpcTokenInfo,
}

#[derive(Debug, Deserialize)]
struct RpcTokenInfo {
    #[serde(rename = "tokenAmount")]
    token_amount: RpcTokenAmount,
}

#[derive(Debug, Deserialize)]
struct RpcTokenAmount {
    #[serde(rename = "uiAmount")]
    ui_amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EnhancedTransaction {
    signature: String,
    timestamp: Option<i64>,
    #[serde(rename = "tokenTransfers", default)]
    token_transfers: Vec<EnhancedTokenTransfer>,
    #[serde(rename = "nativeTransfers", default)]
    native_transfers: Vec<EnhancedNativeTransfer>,
}

#[derive(Debug, Deserialize)]
struct EnhancedTokenTransfer {
    #[serde(rename = "fromUserAccount")]
    from_user_account: Option<String>,
    #[serde(rename = "toUserAccount")]
    to_user_account: Option<String>,
    mint: Option<String>,
    #[serde(rename = "tokenAmount")]
    token_amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EnhancedNativeTransfer {
    #[serde(rename = "toUserAccount")]
    to_user_account: Option<String>,
    /// Lamports
    amount: Option<u64>,
}

#[async_trait]
impl ChainApi for HttpChainApi {
    async fn get_token_balance(
        &self,
        wallet_address: &str,
        token_address: &str,
    ) -> Result<f64, String> {
        let url = format!("{}/?api-key={}", self.rpc_url, self.api_key);
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTokenAccountsByOwner",
            "params": [
                wallet_address,
                { "mint": token_address },
                { "encoding": "jsonParsed" }
            ]
        });

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Balance request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("Balance request returned HTTP {}", status));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse balance response: {}", e))?;

        if let Some(err) = parsed.error {
            return Err(format!("Balance RPC error: {}", err));
        }

        let total = parsed
            .result
            .map(|r| {
                r.value
                    .iter()
                    .filter_map(|a| a.account.data.parsed.info.token_amount.ui_amount)
                    .sum()
            })
            .unwrap_or(0.0);

        Ok(total)
    }

    async fn get_recent_transfers(
        &self,
        wallet_address: &str,
        limit: u32,
    ) -> Result<Vec<ParsedTransfer>, String> {
        let url = format!(
            "{}/v0/addresses/{}/transactions?api-key={}&limit={}",
            self.enhanced_base_url, wallet_address, self.api_key, limit
        );

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| format!("Transaction history request failed: {}", e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err("Transaction history rate limited (429)".to_string());
        }
        if !status.is_success() {
            return Err(format!("Transaction history returned HTTP {}", status));
        }

        let transactions: Vec<EnhancedTransaction> = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse transaction history: {}", e))?;

        let mut transfers = Vec::new();
        for tx in transactions {
            // Native lamports flowing back to the wallet in this transaction
            // are the counterpart proceeds for any outgoing token transfer
            let native_to_wallet: u64 = tx
                .native_transfers
                .iter()
                .filter(|n| n.to_user_account.as_deref() == Some(wallet_address))
                .filter_map(|n| n.amount)
                .sum();
            let counterpart_sol = if native_to_wallet > 0 {
                Some(native_to_wallet as f64 / 1e9)
            } else {
                None
            };

            for transfer in tx.token_transfers {
                let (Some(mint), Some(amount)) = (transfer.mint.clone(), transfer.token_amount)
                else {
                    continue;
                };
                if amount <= 0.0 {
                    continue;
                }
                transfers.push(ParsedTransfer {
                    signature: tx.signature.clone(),
                    timestamp: tx.timestamp,
                    mint,
                    from_wallet: transfer.from_user_account.clone(),
                    to_wallet: transfer.to_user_account.clone(),
                    token_amount: amount,
                    counterpart_sol: if transfer.from_user_account.as_deref()
                        == Some(wallet_address)
                    {
                        counterpart_sol
                    } else {
                        None
                    },
                });
            }
        }

        Ok(transfers)
    }
}
