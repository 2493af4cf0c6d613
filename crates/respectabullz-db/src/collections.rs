//! Import plan: which snapshot collection lands in which table, in which order.
//!
//! The order is the foreign-key dependency order of the relational schema.
//! Every table referenced by a collection appears earlier in [`COLLECTIONS`],
//! except for the self and cyclic references on `dogs`, which are linked
//! after all rows exist.

/// How a snapshot value is turned into a column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Primary key; generated when absent.
    Id,
    Text,
    Integer,
    Real,
    /// Calendar date or instant, stored as RFC 3339 UTC.
    Date,
    /// Like `Date`, but defaults to the import time when absent.
    Timestamp,
    /// Stored as INTEGER 0/1.
    Bool,
    /// Strings are stored verbatim, anything else as serialized JSON.
    Json,
    /// Reference into the named table, filled in once every collection is in.
    DeferredRef(&'static str),
    /// Reference into the named table, set to NULL when the target is missing.
    SoftRef(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// camelCase key in the snapshot; the column name is accepted too.
    pub key: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn opt(key: &'static str, column: &'static str, kind: FieldKind) -> Field {
    Field {
        key,
        column,
        kind,
        required: false,
    }
}

const fn req(key: &'static str, column: &'static str, kind: FieldKind) -> Field {
    Field {
        key,
        column,
        kind,
        required: true,
    }
}

/// What to do when a row with the same key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Fail,
    /// Keep the existing row that shares the named unique column; references
    /// to the skipped legacy id resolve to the kept row.
    Merge(&'static str),
    Replace,
}

impl Conflict {
    pub fn insert_verb(self) -> &'static str {
        match self {
            Self::Fail => "INSERT",
            Self::Merge(_) => "INSERT OR IGNORE",
            Self::Replace => "INSERT OR REPLACE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Name used in progress reports and import counts.
    pub name: &'static str,
    pub snapshot_key: &'static str,
    pub table: &'static str,
    pub conflict: Conflict,
    pub fields: &'static [Field],
}

impl CollectionSpec {
    pub fn deferred_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields
            .iter()
            .filter(|field| matches!(field.kind, FieldKind::DeferredRef(_)))
    }
}

/// Tables whose contents mark a store as already in use.
pub const CORE_TABLES: &[&str] = &["dogs", "litters", "clients", "sales", "expenses"];

/// Snapshot keys of the collections that make a snapshot worth importing.
pub const CORE_SNAPSHOT_KEYS: &[&str] = &["dogs", "litters", "clients", "sales", "expenses"];

use FieldKind::{Bool, Date, DeferredRef, Id, Integer, Json, Real, SoftRef, Text, Timestamp};

const CREATED: Field = opt("createdAt", "created_at", Timestamp);
const UPDATED: Field = opt("updatedAt", "updated_at", Timestamp);
const ID: Field = opt("id", "id", Id);

pub const COLLECTIONS: &[CollectionSpec] = &[
    CollectionSpec {
        name: "settings",
        snapshot_key: "settings",
        table: "settings",
        conflict: Conflict::Replace,
        fields: &[
            req("key", "key", Text),
            req("value", "value", Json),
            opt("updatedAt", "updated_at", Timestamp),
        ],
    },
    CollectionSpec {
        name: "external_studs",
        snapshot_key: "externalStuds",
        table: "external_studs",
        conflict: Conflict::Replace,
        fields: &[
            ID,
            req("name", "name", Text),
            opt("breed", "breed", Text),
            opt("registrationNumber", "registration_number", Text),
            opt("ownerName", "owner_name", Text),
            opt("ownerEmail", "owner_email", Text),
            opt("ownerPhone", "owner_phone", Text),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "dogs",
        snapshot_key: "dogs",
        table: "dogs",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("name", "name", Text),
            opt("callName", "call_name", Text),
            opt("registrationNumber", "registration_number", Text),
            req("sex", "sex", Text),
            req("breed", "breed", Text),
            opt("dateOfBirth", "date_of_birth", Date),
            opt("color", "color", Text),
            opt("microchipNumber", "microchip_number", Text),
            opt("status", "status", Text),
            opt("sireId", "sire_id", DeferredRef("dogs")),
            opt("damId", "dam_id", DeferredRef("dogs")),
            opt("litterId", "litter_id", DeferredRef("litters")),
            opt("isRetained", "is_retained", Bool),
            opt("registrationJson", "registration_json", Json),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "clients",
        snapshot_key: "clients",
        table: "clients",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("name", "name", Text),
            opt("email", "email", Text),
            opt("phone", "phone", Text),
            opt("addressLine1", "address_line1", Text),
            opt("city", "city", Text),
            opt("state", "state", Text),
            opt("postalCode", "postal_code", Text),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "litters",
        snapshot_key: "litters",
        table: "litters",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("code", "code", Text),
            opt("nickname", "nickname", Text),
            opt("sireId", "sire_id", Text),
            req("damId", "dam_id", Text),
            opt("breedingDate", "breeding_date", Date),
            opt("dueDate", "due_date", Date),
            opt("whelpDate", "whelp_date", Date),
            opt("totalBorn", "total_born", Integer),
            opt("totalAlive", "total_alive", Integer),
            opt("status", "status", Text),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
            opt("externalStudId", "external_stud_id", Text),
        ],
    },
    CollectionSpec {
        name: "heat_cycles",
        snapshot_key: "heatCycles",
        table: "heat_cycles",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("dogId", "dog_id", Text),
            req("startDate", "start_date", Date),
            opt("standingHeatStart", "standing_heat_start", Date),
            opt("ovulationDate", "ovulation_date", Date),
            opt("endDate", "end_date", Date),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "heat_events",
        snapshot_key: "heatEvents",
        table: "heat_events",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("heatCycleId", "heat_cycle_id", Text),
            req("date", "date", Date),
            req("eventType", "event_type", Text),
            opt("value", "value", Text),
            opt("notes", "notes", Text),
            CREATED,
        ],
    },
    CollectionSpec {
        name: "vaccinations",
        snapshot_key: "vaccinations",
        table: "vaccinations",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("dogId", "dog_id", Text),
            req("date", "date", Date),
            req("vaccineType", "vaccine_type", Text),
            opt("nextDueDate", "next_due_date", Date),
            opt("vetClinic", "vet_clinic", Text),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "weight_entries",
        snapshot_key: "weightEntries",
        table: "weight_entries",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("dogId", "dog_id", Text),
            req("date", "date", Date),
            req("weightLbs", "weight_lbs", Real),
            opt("notes", "notes", Text),
            CREATED,
        ],
    },
    CollectionSpec {
        name: "medical_records",
        snapshot_key: "medicalRecords",
        table: "medical_records",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("dogId", "dog_id", Text),
            req("date", "date", Date),
            req("recordType", "record_type", Text),
            req("description", "description", Text),
            opt("vetClinic", "vet_clinic", Text),
            opt("cost", "cost", Real),
            opt("attachmentPath", "attachment_path", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "genetic_tests",
        snapshot_key: "geneticTests",
        table: "genetic_tests",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("dogId", "dog_id", Text),
            opt("testDate", "test_date", Date),
            req("testType", "test_type", Text),
            req("result", "result", Text),
            opt("labName", "lab_name", Text),
            opt("certificateNumber", "certificate_number", Text),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "health_schedule_templates",
        snapshot_key: "healthScheduleTemplates",
        table: "health_schedule_templates",
        conflict: Conflict::Merge("name"),
        fields: &[
            ID,
            req("name", "name", Text),
            req("taskType", "task_type", Text),
            req("ageDays", "age_days", Integer),
            opt("description", "description", Text),
            opt("isDefault", "is_default", Bool),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "puppy_health_tasks",
        snapshot_key: "puppyHealthTasks",
        table: "puppy_health_tasks",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("litterId", "litter_id", Text),
            opt("puppyId", "puppy_id", Text),
            opt("templateId", "template_id", SoftRef("health_schedule_templates")),
            req("taskType", "task_type", Text),
            req("taskName", "task_name", Text),
            req("dueDate", "due_date", Date),
            opt("completedDate", "completed_date", Date),
            opt("isCompleted", "is_completed", Bool),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "expenses",
        snapshot_key: "expenses",
        table: "expenses",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("date", "date", Date),
            req("amount", "amount", Real),
            req("category", "category", Text),
            opt("vendorName", "vendor_name", Text),
            opt("description", "description", Text),
            opt("paymentMethod", "payment_method", Text),
            opt("isTaxDeductible", "is_tax_deductible", Bool),
            opt("relatedDogId", "related_dog_id", Text),
            opt("relatedLitterId", "related_litter_id", Text),
            opt("receiptPath", "receipt_path", Text),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "transports",
        snapshot_key: "transports",
        table: "transports",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("dogId", "dog_id", Text),
            opt("clientId", "client_id", Text),
            req("date", "date", Date),
            req("mode", "mode", Text),
            opt("shipperCompany", "shipper_company", Text),
            opt("originCity", "origin_city", Text),
            opt("destinationCity", "destination_city", Text),
            opt("trackingNumber", "tracking_number", Text),
            opt("cost", "cost", Real),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "sales",
        snapshot_key: "sales",
        table: "sales",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("clientId", "client_id", Text),
            req("saleDate", "sale_date", Date),
            req("price", "price", Real),
            opt("depositAmount", "deposit_amount", Real),
            opt("depositDate", "deposit_date", Date),
            opt("paymentStatus", "payment_status", Text),
            opt("contractPath", "contract_path", Text),
            opt("transportId", "transport_id", Text),
            opt("isShipped", "is_shipped", Bool),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "sale_puppies",
        snapshot_key: "salePuppies",
        table: "sale_puppies",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("saleId", "sale_id", Text),
            req("dogId", "dog_id", Text),
            opt("price", "price", Real),
            CREATED,
        ],
    },
    CollectionSpec {
        name: "client_interests",
        snapshot_key: "clientInterests",
        table: "client_interests",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("clientId", "client_id", Text),
            opt("dogId", "dog_id", Text),
            opt("litterId", "litter_id", Text),
            req("interestDate", "interest_date", Date),
            opt("status", "status", Text),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "waitlist_entries",
        snapshot_key: "waitlistEntries",
        table: "waitlist_entries",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("clientId", "client_id", Text),
            opt("litterId", "litter_id", Text),
            opt("preference", "preference", Text),
            opt("sexPreference", "sex_preference", Text),
            opt("depositPaid", "deposit_paid", Bool),
            opt("depositAmount", "deposit_amount", Real),
            opt("status", "status", Text),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
            opt("position", "position", Integer),
        ],
    },
    CollectionSpec {
        name: "communication_logs",
        snapshot_key: "communicationLogs",
        table: "communication_logs",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("clientId", "client_id", Text),
            req("date", "date", Date),
            req("channel", "channel", Text),
            opt("direction", "direction", Text),
            req("summary", "summary", Text),
            opt("followUpNeeded", "follow_up_needed", Bool),
            opt("followUpDate", "follow_up_date", Date),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "pedigree_entries",
        snapshot_key: "pedigreeEntries",
        table: "pedigree_entries",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("dogId", "dog_id", Text),
            req("generation", "generation", Integer),
            req("position", "position", Text),
            req("ancestorName", "ancestor_name", Text),
            opt("ancestorRegistration", "ancestor_registration", Text),
            opt("ancestorColor", "ancestor_color", Text),
            opt("notes", "notes", Text),
            CREATED,
            UPDATED,
        ],
    },
    CollectionSpec {
        name: "dog_photos",
        snapshot_key: "dogPhotos",
        table: "dog_photos",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("dogId", "dog_id", Text),
            req("filePath", "file_path", Text),
            opt("caption", "caption", Text),
            opt("isPrimary", "is_primary", Bool),
            opt("takenAt", "taken_at", Date),
            CREATED,
        ],
    },
    CollectionSpec {
        name: "litter_photos",
        snapshot_key: "litterPhotos",
        table: "litter_photos",
        conflict: Conflict::Fail,
        fields: &[
            ID,
            req("litterId", "litter_id", Text),
            req("filePath", "file_path", Text),
            opt("caption", "caption", Text),
            opt("sortOrder", "sort_order", Integer),
            opt("takenAt", "taken_at", Date),
            CREATED,
        ],
    },
];

/// Plan entry for the collection called `name`.
pub fn collection(name: &str) -> Option<&'static CollectionSpec> {
    COLLECTIONS.iter().find(|spec| spec.name == name)
}

/// Plan entry whose snapshot key is `key`.
pub fn collection_by_snapshot_key(key: &str) -> Option<&'static CollectionSpec> {
    COLLECTIONS.iter().find(|spec| spec.snapshot_key == key)
}
