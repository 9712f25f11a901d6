use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use treasury_ledger::db::{self, SharedConnection};
use treasury_ledger::{
    format_amount, format_signed_usd, BalanceReconciler, CoinGeckoClient, Config,
    LiquidityPoolEngine, PaymentReconciler, SwapDetector, TransferClassifier, WalletSyncEngine,
};

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = Config::from_env().context("Invalid configuration")?;

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "init" => run_init(&config),
        "import-wallets" => {
            let Some(csv_path) = args.get(2) else {
                bail!("usage: treasury-ledger import-wallets <wallets.csv>");
            };
            run_import_wallets(&config, Path::new(csv_path))
        }
        "wallets" => {
            let as_of = match (args.get(2).map(String::as_str), args.get(3)) {
                (None, _) => None,
                (Some("--as-of"), Some(ts)) => Some(
                    DateTime::parse_from_rfc3339(ts)
                        .with_context(|| format!("Invalid --as-of timestamp '{}'", ts))?
                        .with_timezone(&Utc),
                ),
                _ => bail!("usage: treasury-ledger wallets [--as-of <RFC3339>]"),
            };
            run_wallets(&config, as_of)
        }
        "sync" => run_sync(&config).await,
        "pools" => run_pools(&config),
        "swaps" => run_swaps(&config).await,
        "reconcile" => run_reconcile(&config),
        "transfers" => run_transfers(&config),
        "add-investment" => {
            let (Some(investor_id), Some(amount), Some(currency)) = (args.get(2), args.get(3), args.get(4)) else {
                bail!("usage: treasury-ledger add-investment <investor_id> <amount> <currency>");
            };
            let amount: Decimal = amount
                .parse()
                .with_context(|| format!("Invalid amount '{}'", amount))?;
            run_add_investment(&config, investor_id, amount, currency)
        }
        "link-payment" => {
            let (Some(tx_id), Some(investment_id)) = (args.get(2), args.get(3)) else {
                bail!("usage: treasury-ledger link-payment <tx_id> <investment_id>");
            };
            run_link_payment(&config, tx_id, investment_id)
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("Treasury Ledger {}", treasury_ledger::VERSION);
    println!();
    println!("Commands:");
    println!("  init                     Create the ledger database");
    println!("  import-wallets <csv>     Register wallets (label,address,network,currency,token_contract,platform)");
    println!("  wallets [--as-of <ts>]   List wallets, optionally as they were at an RFC3339 time");
    println!("  sync                     Sync all active wallets, rebuild pools, classify transfers");
    println!("  pools                    Show liquidity pools and check them against wallets");
    println!("  swaps                    Detect and value swaps, list recorded swaps");
    println!("  reconcile                Reconcile investment payments and wallet balances");
    println!("  transfers                Show internal transfers and conflicts");
    println!("  add-investment <investor> <amount> <currency>");
    println!("                           Record an investor commitment");
    println!("  link-payment <tx_id> <investment_id>");
    println!("                           Attach a ledger row to an investment and reconcile it");
}

fn open(config: &Config) -> Result<SharedConnection> {
    let conn = db::open_database(&config.db_path)
        .with_context(|| format!("Failed to open database {:?}", config.db_path))?;
    Ok(db::shared(conn))
}

fn run_init(config: &Config) -> Result<()> {
    println!("🗄️  Treasury Ledger - database setup");
    println!("{}", RULE);

    open(config)?;
    println!("✓ Database ready at {:?} (WAL mode)", config.db_path);
    Ok(())
}

fn run_import_wallets(config: &Config, csv_path: &Path) -> Result<()> {
    println!("📂 Importing wallets from {:?}", csv_path);
    println!("{}", RULE);

    let wallets = db::load_wallets_csv(csv_path)?;
    println!("✓ Loaded {} wallets from CSV", wallets.len());

    let shared = open(config)?;
    let conn = db::lock(&shared);

    let mut known: HashSet<(String, String)> = db::get_current_wallets(&conn)?
        .iter()
        .map(|w| (w.address_key(), w.currency.clone()))
        .collect();

    let mut added = 0;
    for wallet in &wallets {
        if !known.insert((wallet.address_key(), wallet.currency.clone())) {
            println!("  ↷ {} already tracked ({} {})", wallet.label, wallet.network, wallet.address);
            continue;
        }
        db::insert_wallet(&conn, wallet, "cli")?;
        added += 1;
    }

    println!("\n✓ Registered {} new wallets ({} skipped)", added, wallets.len() - added);
    Ok(())
}

fn run_wallets(config: &Config, as_of: Option<DateTime<Utc>>) -> Result<()> {
    match as_of {
        Some(at) => println!("👛 Wallets as of {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("👛 Wallets"),
    }
    println!("{}", RULE);

    let shared = open(config)?;
    let conn = db::lock(&shared);
    let registry = db::load_wallet_registry(&conn)?;

    let wallets: Vec<_> = match as_of {
        Some(at) => registry
            .all_wallets()
            .iter()
            .filter_map(|w| registry.get_wallet_at_time(&w.id, at))
            .collect(),
        None => registry.all_wallets(),
    };

    for wallet in &wallets {
        let marker = if wallet.is_active { "●" } else { "○" };
        println!(
            "  {} {:<28} {:<8} {:>24}  v{}  {}",
            marker,
            wallet.label,
            wallet.network.as_str(),
            format_amount(wallet.balance, &wallet.currency),
            wallet.version,
            wallet.address
        );
    }

    println!("\n{}", RULE);
    println!("{} wallets", wallets.len());
    Ok(())
}

async fn run_sync(config: &Config) -> Result<()> {
    println!("🔃 Syncing wallets");
    println!("{}", RULE);

    let shared = open(config)?;
    let engine = WalletSyncEngine::from_config(shared, config)?;
    let report = engine.sync_all().await?;

    for outcome in &report.synced {
        let marker = if outcome.changed() { "↑" } else { "=" };
        println!(
            "  {} {:<28} {:>24} → {:>24}  (+{} tx)",
            marker,
            outcome.label,
            format_amount(outcome.previous_balance, &outcome.currency),
            format_amount(outcome.new_balance, &outcome.currency),
            outcome.transfers_imported
        );
    }
    for failure in &report.failed {
        println!("  ✗ {:<28} {}", failure.label, failure.error);
    }

    println!("\n💧 Pools");
    for pool in &report.pools {
        println!(
            "  {:<8} {:>28}  ({} wallets)",
            pool.currency,
            format_amount(pool.total_balance, &pool.currency),
            pool.wallet_count
        );
    }

    println!("\n{}", RULE);
    println!("{}", report.summary());
    println!("{}", report.internal_transfers.summary());
    Ok(())
}

fn run_pools(config: &Config) -> Result<()> {
    println!("💧 Liquidity pools");
    println!("{}", RULE);

    let shared = open(config)?;
    let conn = db::lock(&shared);
    let pools = db::get_liquidity_pools(&conn)?;
    let wallets = db::get_current_wallets(&conn)?;

    for pool in &pools {
        println!(
            "  {:<8} {:>28}  ({} wallets, updated {})",
            pool.currency,
            format_amount(pool.total_balance, &pool.currency),
            pool.wallet_count,
            pool.updated_at.format("%Y-%m-%d %H:%M UTC")
        );
    }

    let violations = LiquidityPoolEngine::new().verify(&pools, &wallets);
    if violations.is_empty() {
        println!("\n✅ Pools match wallet balances");
    } else {
        println!("\n⚠️  {} pools out of date (run `sync`):", violations.len());
        for v in &violations {
            println!(
                "  {:<8} pool {} vs wallets {}",
                v.currency,
                format_amount(v.pool_total, &v.currency),
                format_amount(v.wallet_total, &v.currency)
            );
        }
    }
    Ok(())
}

async fn run_swaps(config: &Config) -> Result<()> {
    println!("🔄 Swap detection");
    println!("{}", RULE);

    let shared = open(config)?;
    let detector = SwapDetector::with_window(chrono::Duration::minutes(config.swap_window_minutes));
    let prices = CoinGeckoClient::new(
        treasury_ledger::chain::build_http_client(config.http_timeout_secs)?,
        &config.coingecko_base_url,
    );

    let added = detector.scan(&shared, &prices).await?;
    println!("✓ {} new swaps recorded\n", added.len());

    let conn = db::lock(&shared);
    let swaps = db::get_swaps(&conn)?;
    for swap in &swaps {
        let pnl = swap
            .profit_loss_usd
            .map(format_signed_usd)
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "  {}  {:<10} {:>22} → {:>22}  P&L {}",
            swap.detected_at.format("%Y-%m-%d"),
            swap.platform,
            format_amount(swap.sold_amount, &swap.sold_currency),
            format_amount(swap.bought_amount, &swap.bought_currency),
            pnl
        );
    }
    Ok(())
}

fn run_reconcile(config: &Config) -> Result<()> {
    println!("⚖️  Reconciliation");
    println!("{}", RULE);

    let shared = open(config)?;
    let conn = db::lock(&shared);

    println!("\n💼 Investment payments");
    let payments = PaymentReconciler::with_tolerance(config.payment_tolerance).reconcile_all(&conn)?;
    for result in &payments {
        let marker = if result.changed() { "→" } else { " " };
        println!(
            "  {} {:<38} {:>20} / {:<20} {}",
            marker,
            result.investment_id,
            format_amount(result.received, &result.currency),
            format_amount(result.committed, &result.currency),
            result.status
        );
    }

    println!("\n🏦 Wallet balances");
    let reports = BalanceReconciler::new().reconcile_all(&conn)?;
    let mut unbalanced = 0;
    for report in &reports {
        let marker = if report.is_balanced() { "✅" } else { "❌" };
        if !report.is_balanced() {
            unbalanced += 1;
        }
        println!("  {} {}", marker, report.summary());
    }

    println!("\n{}", RULE);
    println!(
        "{} investments ({} changed), {} wallets ({} unbalanced)",
        payments.len(),
        payments.iter().filter(|p| p.changed()).count(),
        reports.len(),
        unbalanced
    );
    Ok(())
}

fn run_transfers(config: &Config) -> Result<()> {
    println!("🔁 Internal transfers");
    println!("{}", RULE);

    let shared = open(config)?;
    let conn = db::lock(&shared);
    let wallets = db::get_current_wallets(&conn)?;
    let report = TransferClassifier::from_wallets(&wallets).mark_internal(&conn)?;

    for pair in &report.pairs {
        println!(
            "  ✓ {} {} {}",
            pair.tx_hash,
            format_amount(pair.outgoing.amount, &pair.outgoing.currency),
            pair.outgoing.occurred_at.format("%Y-%m-%d %H:%M")
        );
    }
    for one in &report.one_sided {
        println!("  … {} waiting for {} leg", one.tx_hash, one.missing.as_str());
    }
    for conflict in &report.conflicts {
        println!("  ✗ {} {:?}", conflict.tx_hash, conflict.reasons);
    }

    println!("\n{}", RULE);
    println!("{}", report.summary());
    Ok(())
}

fn run_add_investment(config: &Config, investor_id: &str, amount: Decimal, currency: &str) -> Result<()> {
    println!("💼 New investment");
    println!("{}", RULE);

    let shared = open(config)?;
    let conn = db::lock(&shared);
    let investment = db::create_investment(&conn, investor_id, amount, currency, "cli")?;

    println!("✓ {} committed {}", investment.investor_id, format_amount(investment.amount, &investment.currency));
    println!("  id: {}", investment.id);
    Ok(())
}

fn run_link_payment(config: &Config, tx_id: &str, investment_id: &str) -> Result<()> {
    println!("🔗 Linking payment");
    println!("{}", RULE);

    let shared = open(config)?;
    let conn = db::lock(&shared);
    db::link_transaction_to_investment(&conn, tx_id, investment_id, "cli")?;
    println!("✓ {} → {}", tx_id, investment_id);

    let investment = db::get_investment(&conn, investment_id)?
        .with_context(|| format!("Investment {} disappeared", investment_id))?;
    let result = PaymentReconciler::with_tolerance(config.payment_tolerance).reconcile_one(&conn, &investment)?;

    println!("\n{}", RULE);
    println!("{}", result.summary());
    Ok(())
}
