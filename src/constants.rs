/// Shared names and defaults used across the pipeline

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const CONFIG_ENV_VAR: &str = "LAB_SCRAPER_CONFIG";

/// Entries echoed to the terminal after a harvest
pub const HARVEST_PREVIEW: usize = 25;

/// File extensions picked up from the input directory
pub const SUPPORTED_EXTENSIONS: [&str; 2] = ["pdf", "txt"];

// Patient columns, in output order
pub const COL_SOURCE_FILE: &str = "source_file";
pub const COL_NAME: &str = "name";
pub const COL_ID_DOCUMENT: &str = "id_document";
pub const COL_OS_CODE: &str = "os_code";
pub const COL_BIRTH_DATE: &str = "birth_date";
pub const COL_AGE: &str = "age";
pub const COL_GENDER: &str = "gender";
pub const COL_TAX_ID: &str = "tax_id";
pub const COL_PHYSICIAN: &str = "physician";
pub const COL_VISIT_ID: &str = "visit_id";
pub const COL_PAYER: &str = "payer";
pub const COL_EXAM_COUNT: &str = "exam_count";

pub const PATIENT_COLUMNS: [&str; 12] = [
    COL_SOURCE_FILE,
    COL_NAME,
    COL_ID_DOCUMENT,
    COL_OS_CODE,
    COL_BIRTH_DATE,
    COL_AGE,
    COL_GENDER,
    COL_TAX_ID,
    COL_PHYSICIAN,
    COL_VISIT_ID,
    COL_PAYER,
    COL_EXAM_COUNT,
];

// Suffixes of the flattened per-test columns
pub const STATUS_SUFFIX: &str = "_status";
pub const REFERENCE_SUFFIX: &str = "_ref";

/// Condition labels treated as the general fallback rule
pub const GENERAL_RULE_LABELS: [&str; 3] = ["geral", "general", "default"];

/// Reference table schema version produced by the loader
pub const REFERENCE_SCHEMA_VERSION: u32 = 2;

pub const DEFAULT_HEADER_MARKERS: [&str; 4] = [
    r"Unidade\s*:",
    r"Responsável Técnico:",
    r"Endereço da Unidade:",
    r"Laboratório inscrito sob CRM",
];

pub const DEFAULT_RELEASE_PREFIXES: [&str; 5] = [
    "liberado eletronicamente por",
    "assinado eletronicamente por",
    "exame liberado eletronicamente por",
    "released electronically by",
    "signed electronically by",
];

pub const DEFAULT_SIGNATURE_MARKERS: [&str; 2] = ["assinatura digital", "digital signature"];
