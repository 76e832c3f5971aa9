//! CSV command tables.
//!
//! Columns `Equipment`, `Command` and `Response` are required; `Port` and
//! `Validation` are optional. A row with a non-empty `Equipment` cell starts a
//! new instrument, and following rows with both a command and a response add
//! rules to it.

use super::table::InstrumentDefinition;
use crate::error::{AppResult, EmulatorError};
use crate::scpi::CommandDefinition;
use csv::{ReaderBuilder, StringRecord, Trim};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const SNIFF_BYTES: usize = 1024;

/// Example table written by the `example-table` command.
pub const EXAMPLE_TABLE: &str = "\
Equipment,Port,Command,Response,Validation
Keysight 34461A DMM,5555,MEAS:VOLT:DC?,1.234567E+00,
,,VOLT (.+),OK,\"range:0,10\"
,,VOLT?,5.0,
,,FUNC (.+),{value},\"enum:VOLT,CURR,RES\"
,,FUNC?,VOLT,
,,OUTP (.+),OK,bool
,,OUTP?,0,
Debug Test Instrument,5559,TEST_RANGE (.+),Range OK: {value},\"range:1,10\"
,,TEST_RANGE?,5,
,,TEST_ENUM (.+),Enum OK: {value},\"enum:A,B,C\"
,,TEST_ENUM?,A,
";

/// File extensions read as delimited text.
const TEXT_TABLE_EXTENSIONS: [&str; 3] = ["csv", "tsv", "txt"];

/// Reads a CSV command table from disk.
///
/// Only delimited text files are accepted. Spreadsheets must be exported to
/// CSV first.
pub fn load_table(path: impl AsRef<Path>) -> AppResult<Vec<InstrumentDefinition>> {
    let path = path.as_ref();
    check_table_extension(path)?;
    let text = fs::read_to_string(path)?;
    let instruments = parse_table(&text)?;
    info!(
        path = %path.display(),
        instruments = instruments.len(),
        commands = instruments.iter().map(|i| i.commands.len()).sum::<usize>(),
        "Loaded command table"
    );
    Ok(instruments)
}

fn check_table_extension(path: &Path) -> AppResult<()> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        e if TEXT_TABLE_EXTENSIONS.contains(&e) => Ok(()),
        "xlsx" | "xlsm" | "xls" | "ods" => Err(EmulatorError::Table(format!(
            "unsupported file type '.{extension}' for {}: export the spreadsheet to CSV",
            path.display()
        ))),
        "" => Err(EmulatorError::Table(format!(
            "unsupported file type for {}: expected a .csv file",
            path.display()
        ))),
        _ => Err(EmulatorError::Table(format!(
            "unsupported file type '.{extension}' for {}: expected a .csv file",
            path.display()
        ))),
    }
}

/// Parses CSV text into instrument definitions, in file order.
pub fn parse_table(text: &str) -> AppResult<Vec<InstrumentDefinition>> {
    let delimiter = sniff_delimiter(text);
    debug!(delimiter = %char::from(delimiter).escape_default(), "Parsing command table");

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let columns = Columns::locate(reader.headers()?)?;

    let mut instruments: Vec<InstrumentDefinition> = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        // Header is line 1.
        let line = index + 2;

        let equipment = columns.cell(&record, Some(columns.equipment));
        if !equipment.is_empty() {
            let mut instrument = InstrumentDefinition::new(equipment);
            let port = columns.cell(&record, columns.port);
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => instrument.port = Some(port),
                    Err(_) => warn!(line, port, "Ignoring non-numeric port"),
                }
            }
            debug!(line, name = %instrument.name, port = ?instrument.port, "New instrument");
            instruments.push(instrument);
        }

        let command = columns.cell(&record, Some(columns.command));
        let response = columns.cell(&record, Some(columns.response));
        if command.is_empty() || response.is_empty() {
            continue;
        }
        let Some(current) = instruments.last_mut() else {
            warn!(line, command, "Command before any equipment row; ignored");
            continue;
        };
        let validation = columns.cell(&record, columns.validation);
        current
            .commands
            .push(CommandDefinition::new(command, response, validation));
    }

    if instruments.is_empty() {
        return Err(EmulatorError::Table(
            "no instruments found in command table".to_string(),
        ));
    }
    Ok(instruments)
}

/// Writes [`EXAMPLE_TABLE`] to `path`.
pub fn write_example_table(path: impl AsRef<Path>) -> AppResult<()> {
    fs::write(path, EXAMPLE_TABLE)?;
    Ok(())
}

/// Tab, then `;`, then `,`, by presence in the first KiB.
fn sniff_delimiter(text: &str) -> u8 {
    let end = text.len().min(SNIFF_BYTES);
    let sample = &text.as_bytes()[..end];
    [b'\t', b';', b',']
        .into_iter()
        .find(|d| sample.contains(d))
        .unwrap_or(b',')
}

struct Columns {
    equipment: usize,
    command: usize,
    response: usize,
    port: Option<usize>,
    validation: Option<usize>,
}

impl Columns {
    fn locate(headers: &StringRecord) -> AppResult<Self> {
        let find = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let require = |name: &str| {
            find(name).ok_or_else(|| {
                EmulatorError::Table(format!(
                    "missing required column '{name}' (found: {})",
                    headers.iter().collect::<Vec<_>>().join(", ")
                ))
            })
        };
        Ok(Self {
            equipment: require("Equipment")?,
            command: require("Command")?,
            response: require("Response")?,
            port: find("Port"),
            validation: find("Validation"),
        })
    }

    fn cell<'r>(&self, record: &'r StringRecord, column: Option<usize>) -> &'r str {
        column.and_then(|c| record.get(c)).unwrap_or("")
    }
}
