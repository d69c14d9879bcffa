use crate::error::ControlError;
use crate::reading::{Reading, TIMESTAMP_FORMAT};
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord, Trim};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

const COLUMNS: [&str; 11] = [
    "timestamp",
    "temperature",
    "humidity",
    "squarefootage",
    "occupancy",
    "hvacusage",
    "lightingusage",
    "renewableenergy",
    "dayofweek",
    "holiday",
    "energyconsumption",
];

struct Columns(HashMap<String, usize>);

impl Columns {
    fn from_headers(headers: &StringRecord) -> Result<Self, ControlError> {
        let index: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_ascii_lowercase(), i))
            .collect();
        let missing: Vec<&str> = COLUMNS
            .iter()
            .copied()
            .filter(|name| !index.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(ControlError::Parse(format!("missing columns: {}", missing.join(", "))));
        }
        Ok(Self(index))
    }

    fn text<'r>(&self, record: &'r StringRecord, name: &str) -> &'r str {
        self.0
            .get(name)
            .and_then(|i| record.get(*i))
            .unwrap_or("")
            .trim()
    }

    fn parse<T: FromStr>(&self, record: &StringRecord, name: &str, line: u64) -> Result<T, ControlError> {
        let raw = self.text(record, name);
        raw.parse::<T>()
            .map_err(|_| ControlError::Parse(format!("line {line}: invalid {name} value '{raw}'")))
    }
}

/// Parses an uploaded dataset. Headers are matched case-insensitively and
/// every row receives a fresh correlation id.
pub fn parse_csv(bytes: &[u8]) -> Result<Vec<Reading>, ControlError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|err| ControlError::Parse(err.to_string()))?
        .clone();
    let columns = Columns::from_headers(&headers)?;

    let mut readings = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| ControlError::Parse(err.to_string()))?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        let raw_timestamp = columns.text(&record, "timestamp");
        let timestamp = NaiveDateTime::parse_from_str(raw_timestamp, TIMESTAMP_FORMAT).map_err(|_| {
            ControlError::Parse(format!("line {line}: invalid timestamp '{raw_timestamp}'"))
        })?;
        readings.push(Reading {
            correlation_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(timestamp),
            temperature: columns.parse(&record, "temperature", line)?,
            humidity: columns.parse(&record, "humidity", line)?,
            square_footage: columns.parse(&record, "squarefootage", line)?,
            occupancy: columns.parse(&record, "occupancy", line)?,
            hvac_state: columns.text(&record, "hvacusage").to_string(),
            lighting_state: columns.text(&record, "lightingusage").to_string(),
            renewable_energy: columns.parse(&record, "renewableenergy", line)?,
            day_of_week: columns.text(&record, "dayofweek").to_string(),
            holiday_flag: columns.text(&record, "holiday").to_string(),
            energy_consumption: columns.parse(&record, "energyconsumption", line)?,
        });
    }
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Timestamp,Temperature,Humidity,SquareFootage,Occupancy,HVACUsage,LightingUsage,RenewableEnergy,DayOfWeek,Holiday,EnergyConsumption";

    #[test]
    fn parses_rows_with_fresh_identities() {
        let body = format!(
            "{HEADER}\n2022-01-01 00:00:00,25.1,43.4,1565.6,5,On,Off,2.77,Monday,No,75.36\n\
             2022-01-01 01:00:00, 27.7 ,54.2,1411.0,1,On,On,21.83,Saturday,No,83.40\n"
        );
        let readings = parse_csv(body.as_bytes()).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].occupancy, 5);
        assert_eq!(readings[0].hvac_state, "On");
        assert_eq!(readings[1].temperature, 27.7);
        assert_eq!(readings[1].day_of_week, "Saturday");
        assert_ne!(readings[0].correlation_id, readings[1].correlation_id);
    }

    #[test]
    fn headers_are_case_insensitive() {
        let body = "timestamp,TEMPERATURE,humidity,squarefootage,occupancy,hvacusage,lightingusage,renewableenergy,dayofweek,holiday,energyconsumption\n\
                    2022-01-01 00:00:00,20,40,1000,3,Off,Off,0,Monday,Yes,60\n";
        let readings = parse_csv(body.as_bytes()).unwrap();
        assert_eq!(readings[0].holiday_flag, "Yes");
    }

    #[test]
    fn missing_columns_are_reported() {
        let err = parse_csv(b"Timestamp,Temperature\n2022-01-01 00:00:00,20\n").unwrap_err();
        assert!(err.to_string().contains("energyconsumption"));
    }

    #[test]
    fn bad_values_name_the_line() {
        let body = format!("{HEADER}\n2022-01-01 00:00:00,warm,43.4,1565.6,5,On,Off,2.77,Monday,No,75.36\n");
        let err = parse_csv(body.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn header_only_upload_is_empty() {
        assert!(parse_csv(format!("{HEADER}\n").as_bytes()).unwrap().is_empty());
    }
}
