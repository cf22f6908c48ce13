//! Shared helpers for ledger integration tests

#![allow(dead_code)]

use rand::Rng;
use rand::seq::SliceRandom;

use simple_bank::models::CreateAccountParams;
use simple_bank::{Account, Queries};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const CURRENCIES: [&str; 3] = ["USD", "EUR", "CAD"];

pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn random_owner() -> String {
    random_string(6)
}

pub fn random_money() -> i64 {
    rand::thread_rng().gen_range(100..=1_000)
}

pub fn random_currency() -> String {
    let mut rng = rand::thread_rng();
    CURRENCIES
        .choose(&mut rng)
        .copied()
        .unwrap_or("USD")
        .to_string()
}

pub async fn create_random_account<Q: Queries + ?Sized>(conn: &mut Q) -> Account {
    let params = CreateAccountParams {
        owner: random_owner(),
        balance: random_money(),
        currency: random_currency(),
    };
    let account = conn
        .create_account(params.clone())
        .await
        .expect("Should create account");

    assert_eq!(account.owner, params.owner);
    assert_eq!(account.balance, params.balance);
    assert_eq!(account.currency, params.currency);
    assert!(account.id > 0);
    account
}

pub async fn create_account_with_balance<Q: Queries + ?Sized>(conn: &mut Q, balance: i64) -> Account {
    conn.create_account(CreateAccountParams {
        owner: random_owner(),
        balance,
        currency: "USD".to_string(),
    })
    .await
    .expect("Should create account")
}
