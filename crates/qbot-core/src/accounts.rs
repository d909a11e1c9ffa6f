//! Registered accounts (`accounts.json`).

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{Account, AccountId},
    errors::Error,
    Result,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    accounts: Vec<Account>,
}

#[derive(Debug)]
pub struct AccountStore {
    path: PathBuf,
    accounts: Vec<Account>,
}

impl AccountStore {
    /// Load `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let accounts = if path.exists() {
            let txt = fs::read_to_string(&path)?;
            if txt.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str::<AccountsFile>(&txt)?.accounts
            }
        } else {
            Vec::new()
        };
        Ok(Self { path, accounts })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[Account] {
        &self.accounts
    }

    pub fn get(&self, name: &AccountId) -> Option<&Account> {
        self.accounts.iter().find(|a| &a.name == name)
    }

    pub fn add(&mut self, account: Account) -> Result<()> {
        validate(&account)?;
        if self.get(&account.name).is_some() {
            return Err(Error::Account(format!(
                "account '{}' already exists",
                account.name
            )));
        }
        self.accounts.push(account);
        self.save()
    }

    /// Returns false if no such account was registered.
    pub fn remove(&mut self, name: &AccountId) -> Result<bool> {
        let before = self.accounts.len();
        self.accounts.retain(|a| &a.name != name);
        if self.accounts.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = AccountsFile {
            accounts: self.accounts.clone(),
        };
        let txt = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, txt)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn validate(account: &Account) -> Result<()> {
    let name = account.name.0.as_str();
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(Error::Account(format!("invalid account name '{name}'")));
    }
    if account.credential_ref.trim().is_empty() {
        return Err(Error::Account(format!(
            "account '{name}' needs a credential reference"
        )));
    }
    Ok(())
}
