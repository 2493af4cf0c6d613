//! Versioned migration steps.
//!
//! Every step must be safe to run against a store that is either untouched by
//! it or already fully migrated by it: a crash between two statements leaves
//! the step half applied and the next start runs it again from the top.
//! Adding a step means appending to [`STEPS`]; versions stay dense from 1.

use rusqlite::Connection;

use crate::db::{table_columns, table_exists, table_has_column};

pub type StepFn = fn(&Connection) -> Result<(), rusqlite::Error>;

#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub version: i64,
    pub name: &'static str,
    pub apply: StepFn,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub const STEPS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        name: "baseline_tables",
        apply: migrate_v1,
    },
    MigrationStep {
        version: 2,
        name: "health_schedule_tables",
        apply: migrate_v2,
    },
    MigrationStep {
        version: 3,
        name: "seed_health_schedule_templates",
        apply: migrate_v3,
    },
    MigrationStep {
        version: 4,
        name: "litters_external_sires",
        apply: migrate_v4,
    },
    MigrationStep {
        version: 5,
        name: "waitlist_positions",
        apply: migrate_v5,
    },
];

#[allow(clippy::cast_possible_wrap)]
pub const TARGET_VERSION: i64 = STEPS.len() as i64;

/// Shadow table used while `litters` is rebuilt in step 4.
pub const LITTERS_SHADOW_TABLE: &str = "litters_new";

pub(crate) const SEED_HEALTH_SCHEDULE_SQL: &str = include_str!("../sql/seed_health_schedule.sql");

/// Original breeding schema, as the first relational release shipped it.
const BASELINE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dogs (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  call_name TEXT,
  registration_number TEXT,
  sex TEXT NOT NULL,
  breed TEXT NOT NULL,
  date_of_birth TEXT,
  color TEXT,
  microchip_number TEXT,
  status TEXT NOT NULL DEFAULT 'active',
  sire_id TEXT REFERENCES dogs(id) ON DELETE SET NULL,
  dam_id TEXT REFERENCES dogs(id) ON DELETE SET NULL,
  litter_id TEXT REFERENCES litters(id) ON DELETE SET NULL,
  is_retained INTEGER NOT NULL DEFAULT 0,
  registration_json TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dogs_status ON dogs(status);
CREATE INDEX IF NOT EXISTS idx_dogs_litter ON dogs(litter_id);

CREATE TABLE IF NOT EXISTS clients (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  email TEXT,
  phone TEXT,
  address_line1 TEXT,
  city TEXT,
  state TEXT,
  postal_code TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_clients_name ON clients(name);

CREATE TABLE IF NOT EXISTS litters (
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  nickname TEXT,
  sire_id TEXT NOT NULL REFERENCES dogs(id),
  dam_id TEXT NOT NULL REFERENCES dogs(id),
  breeding_date TEXT,
  due_date TEXT,
  whelp_date TEXT,
  total_born INTEGER,
  total_alive INTEGER,
  status TEXT NOT NULL DEFAULT 'planned',
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_litters_sire ON litters(sire_id);
CREATE INDEX IF NOT EXISTS idx_litters_dam ON litters(dam_id);

CREATE TABLE IF NOT EXISTS heat_cycles (
  id TEXT PRIMARY KEY,
  dog_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE CASCADE,
  start_date TEXT NOT NULL,
  standing_heat_start TEXT,
  ovulation_date TEXT,
  end_date TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_heat_cycles_dog ON heat_cycles(dog_id);

CREATE TABLE IF NOT EXISTS heat_events (
  id TEXT PRIMARY KEY,
  heat_cycle_id TEXT NOT NULL REFERENCES heat_cycles(id) ON DELETE CASCADE,
  date TEXT NOT NULL,
  event_type TEXT NOT NULL,
  value TEXT,
  notes TEXT,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_heat_events_cycle ON heat_events(heat_cycle_id);

CREATE TABLE IF NOT EXISTS vaccinations (
  id TEXT PRIMARY KEY,
  dog_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE CASCADE,
  date TEXT NOT NULL,
  vaccine_type TEXT NOT NULL,
  next_due_date TEXT,
  vet_clinic TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vaccinations_dog ON vaccinations(dog_id);

CREATE TABLE IF NOT EXISTS weight_entries (
  id TEXT PRIMARY KEY,
  dog_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE CASCADE,
  date TEXT NOT NULL,
  weight_lbs REAL NOT NULL,
  notes TEXT,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_weight_entries_dog ON weight_entries(dog_id);

CREATE TABLE IF NOT EXISTS medical_records (
  id TEXT PRIMARY KEY,
  dog_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE CASCADE,
  date TEXT NOT NULL,
  record_type TEXT NOT NULL,
  description TEXT NOT NULL,
  vet_clinic TEXT,
  cost REAL,
  attachment_path TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_medical_records_dog ON medical_records(dog_id);

CREATE TABLE IF NOT EXISTS genetic_tests (
  id TEXT PRIMARY KEY,
  dog_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE CASCADE,
  test_date TEXT,
  test_type TEXT NOT NULL,
  result TEXT NOT NULL,
  lab_name TEXT,
  certificate_number TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_genetic_tests_dog ON genetic_tests(dog_id);

CREATE TABLE IF NOT EXISTS expenses (
  id TEXT PRIMARY KEY,
  date TEXT NOT NULL,
  amount REAL NOT NULL,
  category TEXT NOT NULL,
  vendor_name TEXT,
  description TEXT,
  payment_method TEXT,
  is_tax_deductible INTEGER NOT NULL DEFAULT 0,
  related_dog_id TEXT REFERENCES dogs(id) ON DELETE SET NULL,
  related_litter_id TEXT REFERENCES litters(id) ON DELETE SET NULL,
  receipt_path TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_expenses_date ON expenses(date);
CREATE INDEX IF NOT EXISTS idx_expenses_category ON expenses(category);

CREATE TABLE IF NOT EXISTS transports (
  id TEXT PRIMARY KEY,
  dog_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE CASCADE,
  client_id TEXT REFERENCES clients(id) ON DELETE SET NULL,
  date TEXT NOT NULL,
  mode TEXT NOT NULL,
  shipper_company TEXT,
  origin_city TEXT,
  destination_city TEXT,
  tracking_number TEXT,
  cost REAL,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transports_dog ON transports(dog_id);

CREATE TABLE IF NOT EXISTS sales (
  id TEXT PRIMARY KEY,
  client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE RESTRICT,
  sale_date TEXT NOT NULL,
  price REAL NOT NULL,
  deposit_amount REAL,
  deposit_date TEXT,
  payment_status TEXT NOT NULL DEFAULT 'pending',
  contract_path TEXT,
  transport_id TEXT REFERENCES transports(id) ON DELETE SET NULL,
  is_shipped INTEGER NOT NULL DEFAULT 0,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sales_client ON sales(client_id);
CREATE INDEX IF NOT EXISTS idx_sales_date ON sales(sale_date);

CREATE TABLE IF NOT EXISTS sale_puppies (
  id TEXT PRIMARY KEY,
  sale_id TEXT NOT NULL REFERENCES sales(id) ON DELETE CASCADE,
  dog_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE CASCADE,
  price REAL,
  created_at TEXT NOT NULL,
  UNIQUE(sale_id, dog_id)
);
CREATE INDEX IF NOT EXISTS idx_sale_puppies_dog ON sale_puppies(dog_id);

CREATE TABLE IF NOT EXISTS client_interests (
  id TEXT PRIMARY KEY,
  client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
  dog_id TEXT REFERENCES dogs(id) ON DELETE SET NULL,
  litter_id TEXT REFERENCES litters(id) ON DELETE SET NULL,
  interest_date TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'interested',
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_client_interests_client ON client_interests(client_id);

CREATE TABLE IF NOT EXISTS waitlist_entries (
  id TEXT PRIMARY KEY,
  client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
  litter_id TEXT REFERENCES litters(id) ON DELETE SET NULL,
  preference TEXT,
  sex_preference TEXT,
  deposit_paid INTEGER NOT NULL DEFAULT 0,
  deposit_amount REAL,
  status TEXT NOT NULL DEFAULT 'waiting',
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_waitlist_entries_client ON waitlist_entries(client_id);

CREATE TABLE IF NOT EXISTS communication_logs (
  id TEXT PRIMARY KEY,
  client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
  date TEXT NOT NULL,
  channel TEXT NOT NULL,
  direction TEXT NOT NULL DEFAULT 'outbound',
  summary TEXT NOT NULL,
  follow_up_needed INTEGER NOT NULL DEFAULT 0,
  follow_up_date TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_communication_logs_client ON communication_logs(client_id);

CREATE TABLE IF NOT EXISTS pedigree_entries (
  id TEXT PRIMARY KEY,
  dog_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE CASCADE,
  generation INTEGER NOT NULL,
  position TEXT NOT NULL,
  ancestor_name TEXT NOT NULL,
  ancestor_registration TEXT,
  ancestor_color TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(dog_id, generation, position)
);

CREATE TABLE IF NOT EXISTS dog_photos (
  id TEXT PRIMARY KEY,
  dog_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE CASCADE,
  file_path TEXT NOT NULL,
  caption TEXT,
  is_primary INTEGER NOT NULL DEFAULT 0,
  taken_at TEXT,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dog_photos_dog ON dog_photos(dog_id);

CREATE TABLE IF NOT EXISTS litter_photos (
  id TEXT PRIMARY KEY,
  litter_id TEXT NOT NULL REFERENCES litters(id) ON DELETE CASCADE,
  file_path TEXT NOT NULL,
  caption TEXT,
  sort_order INTEGER NOT NULL DEFAULT 0,
  taken_at TEXT,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_litter_photos_litter ON litter_photos(litter_id);
";

const HEALTH_SCHEDULE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS health_schedule_templates (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  task_type TEXT NOT NULL,
  age_days INTEGER NOT NULL,
  description TEXT,
  is_default INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS puppy_health_tasks (
  id TEXT PRIMARY KEY,
  litter_id TEXT NOT NULL REFERENCES litters(id) ON DELETE CASCADE,
  puppy_id TEXT REFERENCES dogs(id) ON DELETE CASCADE,
  template_id TEXT REFERENCES health_schedule_templates(id) ON DELETE SET NULL,
  task_type TEXT NOT NULL,
  task_name TEXT NOT NULL,
  due_date TEXT NOT NULL,
  completed_date TEXT,
  is_completed INTEGER NOT NULL DEFAULT 0,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_puppy_health_tasks_litter ON puppy_health_tasks(litter_id);
CREATE INDEX IF NOT EXISTS idx_puppy_health_tasks_due ON puppy_health_tasks(due_date);
";

const EXTERNAL_STUDS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS external_studs (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  breed TEXT,
  registration_number TEXT,
  owner_name TEXT,
  owner_email TEXT,
  owner_phone TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Final `litters` shape: sire optional, outside sire allowed.
const CREATE_LITTERS_SHADOW_SQL: &str = r"
CREATE TABLE litters_new (
  id TEXT PRIMARY KEY,
  code TEXT NOT NULL,
  nickname TEXT,
  sire_id TEXT REFERENCES dogs(id) ON DELETE SET NULL,
  dam_id TEXT NOT NULL REFERENCES dogs(id) ON DELETE RESTRICT,
  breeding_date TEXT,
  due_date TEXT,
  whelp_date TEXT,
  total_born INTEGER,
  total_alive INTEGER,
  status TEXT NOT NULL DEFAULT 'planned',
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  external_stud_id TEXT REFERENCES external_studs(id) ON DELETE SET NULL
);
";

const LITTERS_INDEXES_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_litters_sire ON litters(sire_id);
CREATE INDEX IF NOT EXISTS idx_litters_dam ON litters(dam_id);
CREATE INDEX IF NOT EXISTS idx_litters_external_stud ON litters(external_stud_id);
";

/// Rank entries per litter by creation time; only fills rows still missing a position.
pub(crate) const BACKFILL_WAITLIST_POSITIONS_SQL: &str = r"
UPDATE waitlist_entries
SET position = (
  SELECT COUNT(*)
  FROM waitlist_entries AS earlier
  WHERE COALESCE(earlier.litter_id, '') = COALESCE(waitlist_entries.litter_id, '')
    AND (earlier.created_at < waitlist_entries.created_at
      OR (earlier.created_at = waitlist_entries.created_at AND earlier.id <= waitlist_entries.id))
)
WHERE position IS NULL;
";

/// Look up the step that produces `version`.
pub fn step(version: i64) -> Option<&'static MigrationStep> {
    STEPS.iter().find(|step| step.version == version)
}

/// Migration to v1: Original breeding schema
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(BASELINE_SQL)
}

/// Migration to v2: Puppy health schedule tables
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(HEALTH_SCHEDULE_SQL)
}

/// Migration to v3: Predefined health schedule
fn migrate_v3(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SEED_HEALTH_SCHEDULE_SQL)
}

/// Migration to v4: Outside sires; `litters.sire_id` becomes optional.
///
/// SQLite cannot drop a NOT NULL constraint in place, so the table is rebuilt
/// through `litters_new`. A shadow left behind by an interrupted run is
/// either swapped in (original already dropped) or discarded (original intact).
fn migrate_v4(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(EXTERNAL_STUDS_SQL)?;

    let has_original = table_exists(conn, "litters")?;
    let has_shadow = table_exists(conn, LITTERS_SHADOW_TABLE)?;

    match (has_original, has_shadow) {
        (false, true) => {
            tracing::warn!("Completing interrupted litters rebuild: renaming shadow into place");
            conn.execute_batch("ALTER TABLE litters_new RENAME TO litters;")?;
        }
        (true, true) => {
            tracing::warn!("Discarding stale litters shadow table from an interrupted rebuild");
            conn.execute_batch("DROP TABLE litters_new;")?;
            rebuild_litters_if_needed(conn)?;
        }
        (true, false) => rebuild_litters_if_needed(conn)?,
        (false, false) => {
            conn.execute_batch(CREATE_LITTERS_SHADOW_SQL)?;
            conn.execute_batch("ALTER TABLE litters_new RENAME TO litters;")?;
        }
    }

    conn.execute_batch(LITTERS_INDEXES_SQL)
}

fn rebuild_litters_if_needed(conn: &Connection) -> Result<(), rusqlite::Error> {
    let columns = table_columns(conn, "litters")?;
    let sire_required = columns
        .iter()
        .any(|column| column.name == "sire_id" && column.not_null);
    let has_external_stud = columns.iter().any(|column| column.name == "external_stud_id");

    if has_external_stud && !sire_required {
        return Ok(());
    }

    conn.execute_batch(CREATE_LITTERS_SHADOW_SQL)?;

    let shadow_columns = table_columns(conn, LITTERS_SHADOW_TABLE)?;
    let shared = shadow_columns
        .iter()
        .filter(|shadow| columns.iter().any(|column| column.name == shadow.name))
        .map(|column| column.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let copied = conn.execute(
        &format!("INSERT INTO litters_new ({shared}) SELECT {shared} FROM litters"),
        [],
    )?;

    conn.execute_batch(
        "DROP TABLE litters;
         ALTER TABLE litters_new RENAME TO litters;",
    )?;

    tracing::info!("Rebuilt litters table ({} rows copied)", copied);
    Ok(())
}

/// Migration to v5: Explicit waitlist ordering
fn migrate_v5(conn: &Connection) -> Result<(), rusqlite::Error> {
    if !table_has_column(conn, "waitlist_entries", "position")? {
        conn.execute_batch("ALTER TABLE waitlist_entries ADD COLUMN position INTEGER;")?;
    }

    let filled = conn.execute(BACKFILL_WAITLIST_POSITIONS_SQL, [])?;
    if filled > 0 {
        tracing::info!("Backfilled {} waitlist positions", filled);
    }

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_waitlist_entries_litter_position
         ON waitlist_entries(litter_id, position);",
    )
}
