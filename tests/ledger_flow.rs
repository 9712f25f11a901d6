// End-to-end flow against scripted providers:
// register wallets -> sync -> pools -> internal transfers -> swaps -> reconciliation

use chrono::{Duration, TimeZone, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use treasury_ledger::db;
use treasury_ledger::{
    BalanceReconciler, ChainTransfer, Direction, Investment, MockChainProvider, Network,
    PaymentReconciler, PaymentStatus, ProviderSet, StaticPriceSource, SwapDetector,
    SyncSettings, TransferKind, Wallet, WalletSyncEngine,
};

const COLD_BTC: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
const HOT_BTC: &str = "bc1qxy2kgdygjrsqtzq2n0yrf2493p83kkfjhx0wlh";
const BINANCE_ETH: &str = "0x1111111111111111111111111111111111111111";
const BINANCE_USDT: &str = "0x2222222222222222222222222222222222222222";
const TREASURY_TRON: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";
const INVESTOR_TRON: &str = "TN3W4H6rK2ce4vX9YnFQHwKENnHjoxb3m9";
const OUTSIDE_BTC: &str = "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy";
const ROUTER: &str = "0x3333333333333333333333333333333333333333";

fn transfer(
    hash: &str,
    direction: Direction,
    from: &str,
    to: &str,
    amount: Decimal,
    fee: Decimal,
    at: chrono::DateTime<Utc>,
) -> ChainTransfer {
    ChainTransfer {
        tx_hash: hash.to_string(),
        direction,
        from_address: from.to_string(),
        to_address: to.to_string(),
        amount,
        fee,
        occurred_at: at,
        confirmed: true,
    }
}

#[tokio::test]
async fn test_full_treasury_cycle() {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

    // Wallets
    let cold = Wallet::new("Cold BTC", COLD_BTC, Network::Bitcoin, "BTC");
    let hot = Wallet::new("Hot BTC", HOT_BTC, Network::Bitcoin, "BTC");
    let binance_eth = Wallet::new("Binance ETH", BINANCE_ETH, Network::Ethereum, "ETH").with_platform("binance");
    let binance_usdt = Wallet::new("Binance USDT", BINANCE_USDT, Network::Ethereum, "USDT")
        .with_token_contract("0xdac17f958d2ee523a2206206994597c13d831ec7")
        .with_platform("binance");
    let treasury = Wallet::new("Treasury USDT", TREASURY_TRON, Network::Tron, "USDT");

    let conn = Connection::open_in_memory().unwrap();
    db::setup_database(&conn).unwrap();
    for wallet in [&cold, &hot, &binance_eth, &binance_usdt, &treasury] {
        db::insert_wallet(&conn, wallet, "test").unwrap();
    }
    let investment = Investment::new("investor-7", dec!(1000), "USDT");
    db::insert_investment(&conn, &investment).unwrap();
    let shared = db::shared(conn);

    // Chain state
    let bitcoin = Arc::new(MockChainProvider::new(Network::Bitcoin));
    bitcoin.push_snapshot(COLD_BTC, dec!(1.4999), 2);
    bitcoin.push_snapshot(HOT_BTC, dec!(0.5), 1);
    bitcoin.set_transfers(
        COLD_BTC,
        vec![
            transfer("f00d", Direction::Incoming, OUTSIDE_BTC, COLD_BTC, dec!(2), Decimal::ZERO, t0),
            transfer("beef", Direction::Outgoing, COLD_BTC, HOT_BTC, dec!(0.5), dec!(0.0001), t0 + Duration::hours(1)),
        ],
    );
    bitcoin.set_transfers(
        HOT_BTC,
        vec![transfer("beef", Direction::Incoming, COLD_BTC, HOT_BTC, dec!(0.5), Decimal::ZERO, t0 + Duration::hours(1))],
    );

    let ethereum = Arc::new(MockChainProvider::new(Network::Ethereum));
    ethereum.push_snapshot(BINANCE_ETH, Decimal::ZERO, 1);
    ethereum.push_snapshot(BINANCE_USDT, dec!(3000), 1);
    ethereum.set_transfers(
        BINANCE_ETH,
        vec![
            transfer("0xaa00", Direction::Incoming, ROUTER, BINANCE_ETH, dec!(1), Decimal::ZERO, t0),
            transfer("0xaaa1", Direction::Outgoing, BINANCE_ETH, ROUTER, dec!(1), Decimal::ZERO, t0 + Duration::hours(2)),
        ],
    );
    ethereum.set_transfers(
        BINANCE_USDT,
        vec![transfer(
            "0xaaa2",
            Direction::Incoming,
            ROUTER,
            BINANCE_USDT,
            dec!(3000),
            Decimal::ZERO,
            t0 + Duration::hours(2) + Duration::minutes(10),
        )],
    );

    let tron = Arc::new(MockChainProvider::new(Network::Tron));
    tron.push_snapshot(TREASURY_TRON, dec!(1000), 1);
    tron.set_transfers(
        TREASURY_TRON,
        vec![transfer("cafe01", Direction::Incoming, INVESTOR_TRON, TREASURY_TRON, dec!(1000), Decimal::ZERO, t0)],
    );

    let providers = ProviderSet::new().with(bitcoin).with(ethereum).with(tron);
    let engine = WalletSyncEngine::new(shared.clone(), providers, SyncSettings::default());

    // Sync
    let report = engine.sync_all().await.unwrap();
    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(report.synced.len(), 5);

    let btc_pool = report.pools.iter().find(|p| p.currency == "BTC").unwrap();
    assert_eq!(btc_pool.total_balance, dec!(1.9999));
    let usdt_pool = report.pools.iter().find(|p| p.currency == "USDT").unwrap();
    assert_eq!(usdt_pool.total_balance, dec!(4000));
    assert_eq!(usdt_pool.wallet_count, 2);

    assert_eq!(report.internal_transfers.pairs.len(), 1);
    assert_eq!(report.internal_transfers.pairs[0].tx_hash, "beef");
    assert!(report.internal_transfers.is_clean());

    // Swaps
    let prices = StaticPriceSource::new().with_price("ETH", dec!(3050));
    let swaps = SwapDetector::new().scan(&shared, &prices).await.unwrap();
    assert_eq!(swaps.len(), 1);
    let swap = &swaps[0];
    assert_eq!(swap.platform, "binance");
    assert_eq!(swap.sold_currency, "ETH");
    assert_eq!(swap.bought_currency, "USDT");
    assert_eq!(swap.rate, dec!(3000));
    assert_eq!(swap.profit_loss_usd, Some(dec!(-50)));

    // A second scan finds nothing new
    assert!(SwapDetector::new().scan(&shared, &prices).await.unwrap().is_empty());

    let conn = db::lock(&shared);
    let all = db::get_all_transactions(&conn).unwrap();
    let kind_of = |hash: &str| all.iter().find(|t| t.tx_hash == hash).map(|t| t.kind);
    assert_eq!(kind_of("beef"), Some(TransferKind::Internal));
    assert_eq!(kind_of("0xaaa1"), Some(TransferKind::SwapLeg));
    assert_eq!(kind_of("f00d"), Some(TransferKind::External));

    // Investment payment
    let payment = all.iter().find(|t| t.tx_hash == "cafe01").unwrap();
    db::link_transaction_to_investment(&conn, &payment.id, &investment.id, "test").unwrap();

    let results = PaymentReconciler::new().reconcile_all(&conn).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, PaymentStatus::Paid);
    assert!(results[0].changed());
    let stored = db::get_investment(&conn, &investment.id).unwrap().unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Paid);

    // Balances: every wallet's ledger explains its on-chain balance
    let balances = BalanceReconciler::new().reconcile_all(&conn).unwrap();
    assert_eq!(balances.len(), 5);
    for report in &balances {
        assert!(report.is_balanced(), "{}", report.summary());
    }

    // Audit trail
    let events = db::get_recent_events(&conn, 100).unwrap();
    for kind in ["wallet_synced", "sync_completed", "swap_detected", "payment_status_changed"] {
        assert!(events.iter().any(|e| e.event_type == kind), "missing {} event", kind);
    }
}
