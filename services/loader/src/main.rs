//! Loader Service - Ingests contractor payment CSVs into the star schema
//!
//! Responsibilities:
//! - Validate the fixed CSV column set before touching the database
//! - Skip rows whose (date, staff, job) triple is already loaded
//! - Upsert the six dimension tables (insert-only, natural-key dedup)
//! - Resolve natural keys to surrogate keys
//! - Derive the payment measures (holiday, travel, weather, total)
//! - Insert fact rows, all inside one transaction
//! - Signal the dashboard cache after a successful load
//!
//! CRITICAL: This pipeline must be DETERMINISTIC
//! Same CSV + same warehouse state = same inserts
//!
//! Usage:
//!   cargo run --bin loader -- --csv data/payments.csv
//!   cargo run --bin loader -- --csv data/payments.csv --dry-run
//!   cargo run --bin loader -- --csv data/payments.csv --lenient-measures

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use clap::Parser;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::{PgConnection, Postgres};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads contractor payment CSVs into the warehouse")]
struct Args {
    /// Path to the payment CSV file
    #[arg(long)]
    csv: PathBuf,

    /// Dry run - execute the full pipeline, then roll back
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Coerce unparsable numeric measures to NULL instead of aborting
    #[arg(long, default_value = "false")]
    lenient_measures: bool,
}

// =============================================================================
// CSV SCHEMA
// =============================================================================

/// The fixed column set every upload must carry. Extra columns are ignored
/// with a warning; missing columns abort before any database access.
const REQUIRED_COLUMNS: [&str; 24] = [
    "Date",
    "IsHolidayNSW",
    "IsHolidayVIC",
    "IsHolidayQLD",
    "StaffId",
    "StaffName",
    "ContactPhone",
    "HomeAddress",
    "Email",
    "Department",
    "DeptLocation",
    "DeptPhone",
    "JobId",
    "JobType",
    "JobDescription",
    "IsHoliday",
    "HourRate",
    "VehicleType",
    "KmRate",
    "Weather",
    "Temperature",
    "WeatherAllowance",
    "WorkHours",
    "TravelDistance",
];

/// How to treat a numeric measure field that fails to parse.
#[derive(Debug, Clone, Copy, PartialEq)]
enum MeasurePolicy {
    /// Abort ingestion, naming the line and column (default).
    Strict,
    /// Coerce to a missing value; the derived total goes missing too.
    Lenient,
}

/// One payment event, parsed and normalized, with the date parts and the
/// composite policy keys derived up front.
#[derive(Debug, Clone, PartialEq)]
struct PaymentRecord {
    // date dimension
    date_text: String,
    day_name: String,
    month_name: String,
    month_number: i32,
    year: i32,
    holiday_nsw: bool,
    holiday_vic: bool,
    holiday_qld: bool,
    // staff dimension
    staff_id: String,
    staff_name: String,
    contact_phone: String,
    home_address: String,
    email: String,
    // department dimension
    department: String,
    dept_location: String,
    dept_phone: String,
    // maintenance job dimension
    job_id: String,
    job_type: String,
    job_description: String,
    holiday_flag: Option<f64>,
    hour_rate: Option<f64>,
    // travel allowance policy dimension
    vehicle_type: String,
    km_rate: Option<f64>,
    travel_policy_key: String,
    // weather allowance policy dimension
    weather: String,
    temperature: String,
    weather_allowance: Option<f64>,
    weather_policy_key: String,
    // measures
    work_hours: Option<f64>,
    travel_distance: Option<f64>,
    line: usize,
}

/// Parse the CSV content into payment records.
/// This function is DETERMINISTIC: same input = same output.
///
/// Header validation happens first and reports every missing column at once.
fn parse_csv(content: &str, policy: MeasurePolicy) -> Result<Vec<PaymentRecord>> {
    // Remove UTF-8 BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, h) in headers.iter().enumerate() {
        index.entry(h.as_str()).or_insert(i);
    }

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| !index.contains_key(*c))
        .copied()
        .collect();
    if !missing.is_empty() {
        anyhow::bail!(
            "CSV is missing {} required column(s): {}",
            missing.len(),
            missing.join(", ")
        );
    }

    let required: HashSet<&str> = REQUIRED_COLUMNS.iter().copied().collect();
    for h in &headers {
        if !required.contains(h.as_str()) {
            eprintln!("Warning: ignoring unknown column '{}'", h);
        }
    }

    let mut records = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let line = row_idx + 2; // +1 for 0-index, +1 for header
        let record = result.with_context(|| format!("Line {}: CSV parse error", line))?;

        let field = |col: &str| -> String {
            record.get(index[col]).unwrap_or("").trim().to_string()
        };

        let date_text = field("Date");
        let date = NaiveDate::parse_from_str(&date_text, "%d/%m/%Y")
            .with_context(|| format!("Line {}: invalid Date '{}', expected dd/mm/yyyy", line, date_text))?;

        // The original warehouse folds "heavy rain" into "rain" before the
        // weather policy dimension is keyed.
        let mut weather = field("Weather");
        if weather == "heavy rain" {
            weather = "rain".to_string();
        }
        let temperature = field("Temperature");

        let vehicle_type = field("VehicleType");
        let km_rate_text = field("KmRate");

        records.push(PaymentRecord {
            travel_policy_key: format!("{}|{}", vehicle_type, km_rate_text),
            weather_policy_key: format!("{}|{}", weather, temperature),
            day_name: date.format("%A").to_string(),
            month_name: date.format("%B").to_string(),
            month_number: date.month() as i32,
            year: date.year(),
            holiday_nsw: parse_flag(&field("IsHolidayNSW"), "IsHolidayNSW", line)?,
            holiday_vic: parse_flag(&field("IsHolidayVIC"), "IsHolidayVIC", line)?,
            holiday_qld: parse_flag(&field("IsHolidayQLD"), "IsHolidayQLD", line)?,
            staff_id: field("StaffId"),
            staff_name: field("StaffName"),
            contact_phone: field("ContactPhone"),
            home_address: field("HomeAddress"),
            email: field("Email"),
            department: field("Department"),
            dept_location: field("DeptLocation"),
            dept_phone: field("DeptPhone"),
            job_id: field("JobId"),
            job_type: field("JobType"),
            job_description: field("JobDescription"),
            holiday_flag: parse_measure(&field("IsHoliday"), "IsHoliday", line, policy)?,
            hour_rate: parse_measure(&field("HourRate"), "HourRate", line, policy)?,
            km_rate: parse_measure(&km_rate_text, "KmRate", line, policy)?,
            weather_allowance: parse_measure(&field("WeatherAllowance"), "WeatherAllowance", line, policy)?,
            work_hours: parse_measure(&field("WorkHours"), "WorkHours", line, policy)?,
            travel_distance: parse_measure(&field("TravelDistance"), "TravelDistance", line, policy)?,
            vehicle_type,
            weather,
            temperature,
            date_text,
            line,
        });
    }

    Ok(records)
}

/// Parse a 0/1 or true/false dimension flag. Flags are never coerced.
fn parse_flag(value: &str, column: &str, line: usize) -> Result<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        v if v.eq_ignore_ascii_case("true") => Ok(true),
        v if v.eq_ignore_ascii_case("false") => Ok(false),
        _ => anyhow::bail!("Line {}: column {} has invalid flag '{}'", line, column, value),
    }
}

/// Parse a numeric measure field according to the active policy.
fn parse_measure(
    value: &str,
    column: &str,
    line: usize,
    policy: MeasurePolicy,
) -> Result<Option<f64>> {
    match value.parse::<f64>() {
        Ok(v) => Ok(Some(v)),
        Err(_) => match policy {
            MeasurePolicy::Strict => anyhow::bail!(
                "Line {}: column {} has non-numeric value '{}'",
                line,
                column,
                value
            ),
            MeasurePolicy::Lenient => {
                eprintln!(
                    "Warning: line {}: coercing non-numeric {} '{}' to NULL",
                    line, column, value
                );
                Ok(None)
            }
        },
    }
}

// =============================================================================
// SCHEMA CATALOG - the six dimensions as data, not six copies of code
// =============================================================================

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Everything the generic upsert and the key resolver need to know about one
/// dimension table.
struct DimensionSpec {
    name: &'static str,
    table: &'static str,
    /// Surrogate key column, shared with the fact table's foreign key.
    key_column: &'static str,
    /// Natural key column used for dedup and resolution.
    natural_column: &'static str,
    insert_sql: &'static str,
    natural_key: fn(&PaymentRecord) -> &str,
    bind_insert: for<'q> fn(PgQuery<'q>, &'q PaymentRecord) -> PgQuery<'q>,
}

/// Upsert order is fixed: date, staff, department, job, travel, weather.
static DIMENSIONS: [DimensionSpec; 6] = [
    DimensionSpec {
        name: "date",
        table: "dim_date",
        key_column: "date_key",
        natural_column: "date_text",
        insert_sql: "INSERT INTO dim_date \
            (date_text, day_name, month_name, month_number, year, \
             is_holiday_nsw, is_holiday_vic, is_holiday_qld) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        natural_key: date_key_of,
        bind_insert: bind_date,
    },
    DimensionSpec {
        name: "staff",
        table: "dim_staff",
        key_column: "staff_key",
        natural_column: "staff_id",
        insert_sql: "INSERT INTO dim_staff \
            (staff_id, staff_name, contact_phone, home_address, email, department_name) \
            VALUES ($1, $2, $3, $4, $5, $6)",
        natural_key: staff_key_of,
        bind_insert: bind_staff,
    },
    DimensionSpec {
        name: "department",
        table: "dim_department",
        key_column: "department_key",
        natural_column: "department_name",
        insert_sql: "INSERT INTO dim_department \
            (department_name, location, front_desk_phone) \
            VALUES ($1, $2, $3)",
        natural_key: department_key_of,
        bind_insert: bind_department,
    },
    DimensionSpec {
        name: "maintenance job",
        table: "dim_maintenance_job",
        key_column: "job_key",
        natural_column: "job_id",
        insert_sql: "INSERT INTO dim_maintenance_job \
            (job_id, job_type, description, holiday_flag, hour_rate) \
            VALUES ($1, $2, $3, $4, $5)",
        natural_key: job_key_of,
        bind_insert: bind_job,
    },
    DimensionSpec {
        name: "travel allowance policy",
        table: "dim_travel_policy",
        key_column: "travel_policy_key",
        natural_column: "policy_key",
        insert_sql: "INSERT INTO dim_travel_policy \
            (policy_key, vehicle_type, km_rate) \
            VALUES ($1, $2, $3)",
        natural_key: travel_key_of,
        bind_insert: bind_travel,
    },
    DimensionSpec {
        name: "weather allowance policy",
        table: "dim_weather_policy",
        key_column: "weather_policy_key",
        natural_column: "policy_key",
        insert_sql: "INSERT INTO dim_weather_policy \
            (policy_key, weather_condition, temperature, allowance_amount) \
            VALUES ($1, $2, $3, $4)",
        natural_key: weather_key_of,
        bind_insert: bind_weather,
    },
];

fn date_key_of(r: &PaymentRecord) -> &str {
    &r.date_text
}
fn staff_key_of(r: &PaymentRecord) -> &str {
    &r.staff_id
}
fn department_key_of(r: &PaymentRecord) -> &str {
    &r.department
}
fn job_key_of(r: &PaymentRecord) -> &str {
    &r.job_id
}
fn travel_key_of(r: &PaymentRecord) -> &str {
    &r.travel_policy_key
}
fn weather_key_of(r: &PaymentRecord) -> &str {
    &r.weather_policy_key
}

fn bind_date<'q>(q: PgQuery<'q>, r: &'q PaymentRecord) -> PgQuery<'q> {
    q.bind(r.date_text.as_str())
        .bind(r.day_name.as_str())
        .bind(r.month_name.as_str())
        .bind(r.month_number)
        .bind(r.year)
        .bind(r.holiday_nsw)
        .bind(r.holiday_vic)
        .bind(r.holiday_qld)
}

fn bind_staff<'q>(q: PgQuery<'q>, r: &'q PaymentRecord) -> PgQuery<'q> {
    q.bind(r.staff_id.as_str())
        .bind(r.staff_name.as_str())
        .bind(r.contact_phone.as_str())
        .bind(r.home_address.as_str())
        .bind(r.email.as_str())
        .bind(r.department.as_str())
}

fn bind_department<'q>(q: PgQuery<'q>, r: &'q PaymentRecord) -> PgQuery<'q> {
    q.bind(r.department.as_str())
        .bind(r.dept_location.as_str())
        .bind(r.dept_phone.as_str())
}

fn bind_job<'q>(q: PgQuery<'q>, r: &'q PaymentRecord) -> PgQuery<'q> {
    q.bind(r.job_id.as_str())
        .bind(r.job_type.as_str())
        .bind(r.job_description.as_str())
        .bind(r.holiday_flag)
        .bind(r.hour_rate)
}

fn bind_travel<'q>(q: PgQuery<'q>, r: &'q PaymentRecord) -> PgQuery<'q> {
    q.bind(r.travel_policy_key.as_str())
        .bind(r.vehicle_type.as_str())
        .bind(r.km_rate)
}

fn bind_weather<'q>(q: PgQuery<'q>, r: &'q PaymentRecord) -> PgQuery<'q> {
    q.bind(r.weather_policy_key.as_str())
        .bind(r.weather.as_str())
        .bind(r.temperature.as_str())
        .bind(r.weather_allowance)
}

// =============================================================================
// DUPLICATE DETECTOR
// =============================================================================

/// Natural composite key of a fact row.
fn dedup_triple(r: &PaymentRecord) -> (String, String, String) {
    (r.date_text.clone(), r.staff_id.clone(), r.job_id.clone())
}

/// Fetch the (date, staff, job) triples already present in the fact table.
/// An empty fact table short-circuits: no join is attempted.
async fn fetch_existing_triples(
    conn: &mut PgConnection,
) -> Result<HashSet<(String, String, String)>> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fact_payment")
        .fetch_one(&mut *conn)
        .await
        .context("counting fact rows")?;
    if count == 0 {
        return Ok(HashSet::new());
    }

    let rows: Vec<(String, String, String)> = sqlx::query_as(
        r#"
        SELECT d.date_text, s.staff_id, j.job_id
        FROM fact_payment f
        JOIN dim_date d ON f.date_key = d.date_key
        JOIN dim_staff s ON f.staff_key = s.staff_key
        JOIN dim_maintenance_job j ON f.job_key = j.job_key
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .context("reading existing fact triples")?;

    Ok(rows.into_iter().collect())
}

/// Partition the batch into rows to load and rows already present.
/// Duplicates are reported, never errors.
fn partition_duplicates(
    records: Vec<PaymentRecord>,
    existing: &HashSet<(String, String, String)>,
) -> (Vec<PaymentRecord>, Vec<PaymentRecord>) {
    records
        .into_iter()
        .partition(|r| !existing.contains(&dedup_triple(r)))
}

// =============================================================================
// DIMENSION UPSERTER
// =============================================================================

/// Pick the batch indices that need a new dimension row: dedup the batch on
/// the natural key (first occurrence wins, input order preserved), then
/// subtract the keys already in the table.
fn plan_new_rows(keys: &[&str], existing: &HashSet<String>) -> Vec<usize> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut fresh = Vec::new();
    for (idx, &key) in keys.iter().enumerate() {
        if existing.contains(key) {
            continue;
        }
        if seen.insert(key) {
            fresh.push(idx);
        }
    }
    fresh
}

/// Insert-only upsert for one dimension. Runs inside the upload transaction;
/// surrogate keys come from the table's identity column. Returns the number
/// of rows inserted.
async fn upsert_dimension(
    conn: &mut PgConnection,
    spec: &DimensionSpec,
    records: &[PaymentRecord],
) -> Result<u64> {
    if records.is_empty() {
        return Ok(0);
    }

    let select = format!("SELECT {} FROM {}", spec.natural_column, spec.table);
    let existing: HashSet<String> = sqlx::query_scalar(&select)
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("reading existing {} keys", spec.name))?
        .into_iter()
        .collect();

    let keys: Vec<&str> = records.iter().map(|r| (spec.natural_key)(r)).collect();
    let fresh = plan_new_rows(&keys, &existing);

    for &idx in &fresh {
        let query = (spec.bind_insert)(sqlx::query(spec.insert_sql), &records[idx]);
        query
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting into {}", spec.table))?;
    }

    Ok(fresh.len() as u64)
}

// =============================================================================
// KEY RESOLVER
// =============================================================================

/// Natural key -> surrogate key, one map per dimension, in DIMENSIONS order.
type KeyLookups = [HashMap<String, i64>; 6];

async fn fetch_key_lookups(conn: &mut PgConnection) -> Result<KeyLookups> {
    let mut lookups: KeyLookups = Default::default();
    for (slot, spec) in DIMENSIONS.iter().enumerate() {
        let select = format!(
            "SELECT {}, {} FROM {}",
            spec.natural_column, spec.key_column, spec.table
        );
        let rows: Vec<(String, i64)> = sqlx::query_as(&select)
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("reading {} lookup", spec.name))?;
        lookups[slot] = rows.into_iter().collect();
    }
    Ok(lookups)
}

/// Map every row's natural keys to surrogate keys. Total function: a missing
/// match yields None so a later report can name every unresolved column at
/// once instead of failing on the first.
fn resolve_keys(records: &[PaymentRecord], lookups: &KeyLookups) -> Vec<[Option<i64>; 6]> {
    records
        .iter()
        .map(|r| {
            let mut keys = [None; 6];
            for (slot, spec) in DIMENSIONS.iter().enumerate() {
                keys[slot] = lookups[slot].get((spec.natural_key)(r)).copied();
            }
            keys
        })
        .collect()
}

// =============================================================================
// MEASURE CALCULATOR
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Measures {
    holiday_payment: Option<f64>,
    travel_allowance: Option<f64>,
    weather_allowance_amount: Option<f64>,
    total_paid: Option<f64>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Derive the payment breakdown, rounded to 2 decimals at each step.
/// Missing inputs propagate to missing outputs.
fn compute_measures(r: &PaymentRecord) -> Measures {
    let base_pay = match (r.work_hours, r.hour_rate) {
        (Some(hours), Some(rate)) => Some(round2(hours * rate)),
        _ => None,
    };
    let holiday_payment = match (base_pay, r.holiday_flag) {
        (Some(base), Some(flag)) => Some(round2(base * 0.5 * flag)),
        _ => None,
    };
    let travel_allowance = match (r.travel_distance, r.km_rate) {
        (Some(distance), Some(rate)) => Some(round2(distance * rate)),
        _ => None,
    };
    let weather_allowance_amount = r.weather_allowance.map(round2);
    let total_paid = match (base_pay, holiday_payment, travel_allowance, weather_allowance_amount)
    {
        (Some(base), Some(holiday), Some(travel), Some(weather)) => {
            Some(round2(base + holiday + travel + weather))
        }
        _ => None,
    };

    Measures {
        holiday_payment,
        travel_allowance,
        weather_allowance_amount,
        total_paid,
    }
}

// =============================================================================
// FACT LOADER
// =============================================================================

/// Reject the whole batch if any foreign key failed to resolve, naming every
/// offending column and the count of affected rows. No partial load.
fn check_resolved(resolved: &[[Option<i64>; 6]]) -> Result<()> {
    let mut missing = [0usize; 6];
    let mut bad_rows = 0;
    for row in resolved {
        let mut row_bad = false;
        for (slot, key) in row.iter().enumerate() {
            if key.is_none() {
                missing[slot] += 1;
                row_bad = true;
            }
        }
        if row_bad {
            bad_rows += 1;
        }
    }
    if bad_rows == 0 {
        return Ok(());
    }

    let columns: Vec<String> = DIMENSIONS
        .iter()
        .zip(missing)
        .filter(|(_, count)| *count > 0)
        .map(|(spec, count)| format!("{}={}", spec.key_column, count))
        .collect();
    anyhow::bail!(
        "unresolved foreign keys: {} ({} of {} rows affected); fact load aborted",
        columns.join(", "),
        bad_rows,
        resolved.len()
    )
}

const INSERT_FACT_SQL: &str = "INSERT INTO fact_payment \
    (date_key, staff_key, department_key, job_key, travel_policy_key, weather_policy_key, \
     work_hours, holiday_payment, travel_distance, travel_allowance, \
     weather_condition, weather_allowance, total_paid) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)";

/// Insert one fact row per record. Surrogate payment keys come from the
/// table's identity column. Returns the count inserted.
async fn insert_facts(
    conn: &mut PgConnection,
    records: &[PaymentRecord],
    resolved: &[[Option<i64>; 6]],
    measures: &[Measures],
) -> Result<u64> {
    let mut inserted = 0;
    for ((record, keys), measure) in records.iter().zip(resolved).zip(measures) {
        sqlx::query(INSERT_FACT_SQL)
            .bind(keys[0])
            .bind(keys[1])
            .bind(keys[2])
            .bind(keys[3])
            .bind(keys[4])
            .bind(keys[5])
            .bind(record.work_hours)
            .bind(measure.holiday_payment)
            .bind(record.travel_distance)
            .bind(measure.travel_allowance)
            .bind(record.weather.as_str())
            .bind(measure.weather_allowance_amount)
            .bind(measure.total_paid)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting fact row from line {}", record.line))?;
        inserted += 1;
    }
    Ok(inserted)
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let policy = if args.lenient_measures {
        MeasurePolicy::Lenient
    } else {
        MeasurePolicy::Strict
    };

    println!("=== Contractor Payment Loader ===");
    println!("CSV: {}", args.csv.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let content = tokio::fs::read_to_string(&args.csv)
        .await
        .with_context(|| format!("Failed to read {}", args.csv.display()))?;

    let records = parse_csv(&content, policy)?;
    println!(
        "Step 1: parsed {} payment rows, {} columns validated",
        records.len(),
        REQUIRED_COLUMNS.len()
    );
    if records.is_empty() {
        println!("CSV has no data rows; nothing to load");
        return Ok(());
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    // The whole upload runs in one transaction: a failure in any stage rolls
    // back every dimension insert as well as the fact insert.
    let mut tx = pool.begin().await.context("opening upload transaction")?;

    let existing = fetch_existing_triples(&mut tx).await?;
    let (unique, duplicates) = partition_duplicates(records, &existing);
    println!(
        "Step 2: {} unique rows, {} duplicates skipped",
        unique.len(),
        duplicates.len()
    );
    for dup in duplicates.iter().take(3) {
        println!(
            "  duplicate: date={} staff={} job={} (line {})",
            dup.date_text, dup.staff_id, dup.job_id, dup.line
        );
    }
    if duplicates.len() > 3 {
        println!("  ... and {} more", duplicates.len() - 3);
    }

    if unique.is_empty() {
        println!("All rows already loaded; 0 fact rows inserted");
        return Ok(());
    }

    println!("Step 3: upserting dimensions");
    for spec in &DIMENSIONS {
        let inserted = upsert_dimension(&mut tx, spec, &unique).await?;
        println!("  {}: {} new row(s)", spec.table, inserted);
    }

    let lookups = fetch_key_lookups(&mut tx).await?;
    let resolved = resolve_keys(&unique, &lookups);
    println!("Step 4: resolved surrogate keys for {} rows", resolved.len());

    let measures: Vec<Measures> = unique.iter().map(compute_measures).collect();
    println!("Step 5: derived measures for {} rows", measures.len());

    check_resolved(&resolved)?;
    let inserted = insert_facts(&mut tx, &unique, &resolved, &measures).await?;

    if args.dry_run {
        tx.rollback().await.context("rolling back dry run")?;
        println!("Dry run - rolled back; would have inserted {} fact rows", inserted);
        return Ok(());
    }

    tx.commit().await.context("committing upload transaction")?;
    println!("Step 6: inserted {} fact rows", inserted);

    // Best-effort signal; the load itself has already committed.
    if let Ok(base) = std::env::var("DASHBOARD_URL") {
        let url = format!("{}/cache/invalidate", base.trim_end_matches('/'));
        match reqwest::Client::new().post(&url).send().await {
            Ok(resp) => println!("Dashboard cache invalidated ({})", resp.status()),
            Err(e) => eprintln!("Warning: cache invalidation signal failed: {}", e),
        }
    }

    println!("\n=== Load Complete ===");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Date,IsHolidayNSW,IsHolidayVIC,IsHolidayQLD,\
StaffId,StaffName,ContactPhone,HomeAddress,Email,Department,DeptLocation,DeptPhone,\
JobId,JobType,JobDescription,IsHoliday,HourRate,VehicleType,KmRate,\
Weather,Temperature,WeatherAllowance,WorkHours,TravelDistance";

    fn sample_row() -> String {
        "25/12/2024,1,1,0,S001,Alice Wong,0400111222,12 High St,alice@example.com,\
Plumbing,Sydney,0298765432,J100,PLB,Burst pipe repair,1,50,car,0.80,\
sunny,28,5.00,8,10"
            .to_string()
    }

    fn sample_csv() -> String {
        format!("{}\n{}\n", HEADER, sample_row())
    }

    fn parse_one(csv: &str) -> PaymentRecord {
        let mut records = parse_csv(csv, MeasurePolicy::Strict).unwrap();
        assert_eq!(records.len(), 1);
        records.remove(0)
    }

    // -------------------------------------------------------------------------
    // CSV SCHEMA TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_valid_row() {
        let r = parse_one(&sample_csv());
        assert_eq!(r.date_text, "25/12/2024");
        assert_eq!(r.staff_id, "S001");
        assert_eq!(r.department, "Plumbing");
        assert_eq!(r.job_id, "J100");
        assert_eq!(r.hour_rate, Some(50.0));
        assert_eq!(r.work_hours, Some(8.0));
        assert_eq!(r.travel_distance, Some(10.0));
        assert_eq!(r.line, 2);
    }

    #[test]
    fn test_missing_column_rejected_before_processing() {
        let csv = sample_csv().replace("HourRate", "Rate");
        let err = parse_csv(&csv, MeasurePolicy::Strict).unwrap_err();
        assert!(err.to_string().contains("HourRate"));
    }

    #[test]
    fn test_missing_columns_all_named_at_once() {
        // Drop both HourRate and Email from the header
        let csv = sample_csv()
            .replace("HourRate", "XColA")
            .replace("Email", "XColB");
        let err = parse_csv(&csv, MeasurePolicy::Strict).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("HourRate"));
        assert!(msg.contains("Email"));
        assert!(msg.contains("2 required column(s)"));
    }

    #[test]
    fn test_extra_column_ignored() {
        let csv = format!("{},Note\n{},hello\n", HEADER, sample_row());
        let r = parse_one(&csv);
        assert_eq!(r.staff_id, "S001");
    }

    #[test]
    fn test_empty_csv_yields_no_records() {
        let csv = format!("{}\n", HEADER);
        let records = parse_csv(&csv, MeasurePolicy::Strict).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_whitespace_trimmed() {
        let csv = sample_csv().replace("S001", "  S001  ");
        let r = parse_one(&csv);
        assert_eq!(r.staff_id, "S001");
    }

    #[test]
    fn test_bom_stripped() {
        let csv = format!("\u{feff}{}", sample_csv());
        let r = parse_one(&csv);
        assert_eq!(r.date_text, "25/12/2024");
    }

    #[test]
    fn test_invalid_date_rejected() {
        let csv = sample_csv().replace("25/12/2024", "2024-12-25");
        let err = parse_csv(&csv, MeasurePolicy::Strict).unwrap_err();
        assert!(err.to_string().contains("dd/mm/yyyy"));
    }

    #[test]
    fn test_date_parts_derived() {
        let r = parse_one(&sample_csv());
        assert_eq!(r.day_name, "Wednesday");
        assert_eq!(r.month_name, "December");
        assert_eq!(r.month_number, 12);
        assert_eq!(r.year, 2024);
    }

    #[test]
    fn test_holiday_flags_parsed() {
        let r = parse_one(&sample_csv());
        assert!(r.holiday_nsw);
        assert!(r.holiday_vic);
        assert!(!r.holiday_qld);
    }

    #[test]
    fn test_invalid_flag_rejected() {
        let csv = format!("{}\n{}\n", HEADER, sample_row().replacen("1,1,0", "yes,1,0", 1));
        let err = parse_csv(&csv, MeasurePolicy::Strict).unwrap_err();
        assert!(err.to_string().contains("IsHolidayNSW"));
    }

    #[test]
    fn test_heavy_rain_normalized() {
        let csv = sample_csv().replace("sunny", "heavy rain");
        let r = parse_one(&csv);
        assert_eq!(r.weather, "rain");
        assert_eq!(r.weather_policy_key, "rain|28");
    }

    #[test]
    fn test_composite_policy_keys() {
        let r = parse_one(&sample_csv());
        assert_eq!(r.travel_policy_key, "car|0.80");
        assert_eq!(r.weather_policy_key, "sunny|28");
    }

    #[test]
    fn test_strict_measure_rejects_garbage() {
        let csv = sample_csv().replace(",8,10", ",eight,10");
        let err = parse_csv(&csv, MeasurePolicy::Strict).unwrap_err();
        assert!(err.to_string().contains("WorkHours"));
    }

    #[test]
    fn test_lenient_measure_coerces_to_missing() {
        let csv = sample_csv().replace(",8,10", ",eight,10");
        let records = parse_csv(&csv, MeasurePolicy::Lenient).unwrap();
        assert_eq!(records[0].work_hours, None);
        assert_eq!(records[0].travel_distance, Some(10.0));
    }

    #[test]
    fn test_parse_determinism() {
        let csv = sample_csv();
        let a = parse_csv(&csv, MeasurePolicy::Strict).unwrap();
        let b = parse_csv(&csv, MeasurePolicy::Strict).unwrap();
        assert_eq!(a, b);
    }

    // -------------------------------------------------------------------------
    // DIMENSION UPSERT PLANNING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_plan_all_new() {
        let keys = vec!["a", "b", "c"];
        let existing = HashSet::new();
        assert_eq!(plan_new_rows(&keys, &existing), vec![0, 1, 2]);
    }

    #[test]
    fn test_plan_first_occurrence_wins_order_preserved() {
        let keys = vec!["a", "b", "a", "c", "b"];
        let existing = HashSet::new();
        assert_eq!(plan_new_rows(&keys, &existing), vec![0, 1, 3]);
    }

    #[test]
    fn test_plan_subtracts_existing() {
        let keys = vec!["a", "b", "c"];
        let existing: HashSet<String> = ["b".to_string()].into_iter().collect();
        assert_eq!(plan_new_rows(&keys, &existing), vec![0, 2]);
    }

    #[test]
    fn test_plan_idempotent_second_run_inserts_nothing() {
        let keys = vec!["a", "b", "a"];
        let first = plan_new_rows(&keys, &HashSet::new());
        assert_eq!(first.len(), 2);
        // After the first run those keys exist in the table
        let existing: HashSet<String> =
            first.iter().map(|&i| keys[i].to_string()).collect();
        assert!(plan_new_rows(&keys, &existing).is_empty());
    }

    #[test]
    fn test_plan_empty_batch() {
        let existing: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert!(plan_new_rows(&[], &existing).is_empty());
    }

    #[test]
    fn test_cross_dimension_isolation() {
        // New staff member, same department: only the staff plan grows.
        let known = parse_one(&sample_csv());
        let newcomer_csv = sample_csv()
            .replace("S001", "S002")
            .replace("Alice Wong", "Bob Tran");
        let newcomer = parse_one(&newcomer_csv);
        let batch = [known.clone(), newcomer];

        let staff_spec = &DIMENSIONS[1];
        let dept_spec = &DIMENSIONS[2];
        let staff_existing: HashSet<String> =
            [(staff_spec.natural_key)(&known).to_string()].into_iter().collect();
        let dept_existing: HashSet<String> =
            [(dept_spec.natural_key)(&known).to_string()].into_iter().collect();

        let staff_keys: Vec<&str> =
            batch.iter().map(|r| (staff_spec.natural_key)(r)).collect();
        let dept_keys: Vec<&str> =
            batch.iter().map(|r| (dept_spec.natural_key)(r)).collect();

        assert_eq!(plan_new_rows(&staff_keys, &staff_existing), vec![1]);
        assert!(plan_new_rows(&dept_keys, &dept_existing).is_empty());
    }

    // -------------------------------------------------------------------------
    // DUPLICATE DETECTOR TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_empty_fact_table_everything_unique() {
        let records = vec![parse_one(&sample_csv())];
        let (unique, dups) = partition_duplicates(records, &HashSet::new());
        assert_eq!(unique.len(), 1);
        assert!(dups.is_empty());
    }

    #[test]
    fn test_known_triple_is_duplicate() {
        let record = parse_one(&sample_csv());
        let existing: HashSet<_> = [dedup_triple(&record)].into_iter().collect();
        let (unique, dups) = partition_duplicates(vec![record], &existing);
        assert!(unique.is_empty());
        assert_eq!(dups.len(), 1);
    }

    #[test]
    fn test_novel_triple_kept() {
        let record = parse_one(&sample_csv());
        let existing: HashSet<_> = [(
            "26/12/2024".to_string(),
            "S001".to_string(),
            "J100".to_string(),
        )]
        .into_iter()
        .collect();
        let (unique, dups) = partition_duplicates(vec![record], &existing);
        assert_eq!(unique.len(), 1);
        assert!(dups.is_empty());
    }

    #[test]
    fn test_padded_date_matches_after_trim() {
        // Trim::All strips the padding at parse time, so the triple matches.
        let csv = sample_csv().replace("25/12/2024", " 25/12/2024 ");
        let record = parse_one(&csv);
        let existing: HashSet<_> = [(
            "25/12/2024".to_string(),
            "S001".to_string(),
            "J100".to_string(),
        )]
        .into_iter()
        .collect();
        let (unique, dups) = partition_duplicates(vec![record], &existing);
        assert!(unique.is_empty());
        assert_eq!(dups.len(), 1);
    }

    // -------------------------------------------------------------------------
    // KEY RESOLVER TESTS
    // -------------------------------------------------------------------------

    fn lookups_for(record: &PaymentRecord) -> KeyLookups {
        let mut lookups: KeyLookups = Default::default();
        for (slot, spec) in DIMENSIONS.iter().enumerate() {
            lookups[slot].insert((spec.natural_key)(record).to_string(), (slot + 1) as i64);
        }
        lookups
    }

    #[test]
    fn test_resolve_all_keys() {
        let record = parse_one(&sample_csv());
        let lookups = lookups_for(&record);
        let resolved = resolve_keys(&[record], &lookups);
        assert_eq!(resolved[0], [Some(1), Some(2), Some(3), Some(4), Some(5), Some(6)]);
    }

    #[test]
    fn test_resolve_missing_key_is_none_not_error() {
        let record = parse_one(&sample_csv());
        let mut lookups = lookups_for(&record);
        lookups[3].clear(); // no maintenance job entries
        let resolved = resolve_keys(&[record], &lookups);
        assert_eq!(resolved[0][3], None);
        assert_eq!(resolved[0][0], Some(1));
    }

    #[test]
    fn test_check_resolved_ok() {
        assert!(check_resolved(&[[Some(1); 6], [Some(2); 6]]).is_ok());
    }

    #[test]
    fn test_check_resolved_names_columns_and_counts() {
        let mut bad = [Some(1); 6];
        bad[3] = None;
        let mut worse = [Some(1); 6];
        worse[3] = None;
        worse[0] = None;
        let err = check_resolved(&[[Some(1); 6], bad, worse]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("job_key=2"));
        assert!(msg.contains("date_key=1"));
        assert!(msg.contains("2 of 3 rows"));
    }

    #[test]
    fn test_check_resolved_single_bad_row_aborts_batch() {
        let mut rows = vec![[Some(1); 6]; 999];
        let mut bad = [Some(1); 6];
        bad[3] = None;
        rows.push(bad);
        assert!(check_resolved(&rows).is_err());
    }

    // -------------------------------------------------------------------------
    // MEASURE CALCULATOR TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_round2() {
        assert_eq!(round2(0.125), 0.13);
        assert_eq!(round2(0.999), 1.0);
        assert_eq!(round2(613.0), 613.0);
    }

    #[test]
    fn test_measure_arithmetic_round_trip() {
        // hours=8, rate=50, flag=1, distance=10, km_rate=0.80, weather=5.00
        let r = parse_one(&sample_csv());
        let m = compute_measures(&r);
        assert_eq!(m.holiday_payment, Some(200.0));
        assert_eq!(m.travel_allowance, Some(8.0));
        assert_eq!(m.weather_allowance_amount, Some(5.0));
        assert_eq!(m.total_paid, Some(613.0));
    }

    #[test]
    fn test_no_holiday_bonus_when_flag_zero() {
        let csv = sample_csv().replace(",1,50,", ",0,50,");
        let r = parse_one(&csv);
        let m = compute_measures(&r);
        assert_eq!(m.holiday_payment, Some(0.0));
        assert_eq!(m.total_paid, Some(413.0));
    }

    #[test]
    fn test_missing_measure_propagates_to_total() {
        let csv = sample_csv().replace(",8,10", ",eight,10");
        let records = parse_csv(&csv, MeasurePolicy::Lenient).unwrap();
        let m = compute_measures(&records[0]);
        assert_eq!(m.holiday_payment, None);
        assert_eq!(m.travel_allowance, Some(8.0));
        assert_eq!(m.total_paid, None);
    }

    #[test]
    fn test_travel_allowance_rounding() {
        let csv = sample_csv().replace("0.80", "0.333").replace(",8,10", ",8,3");
        let r = parse_one(&csv);
        let m = compute_measures(&r);
        assert_eq!(m.travel_allowance, Some(1.0)); // 3 * 0.333 = 0.999
    }
}
