//! Workbook document model.
//!
//! A single streaming pass over the `.twb` XML collects what the extractor
//! and resolver need: datasource columns, worksheets (title, shelves,
//! filters), dashboard zones, range filters, and categorical filter members.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zip::ZipArchive;

use chartdoc_shared::{ChartDocError, Result};

use crate::normalize::norm_key;

/// Zip local-file-header signature.
const ZIP_SIGNATURE: &[u8] = b"PK\x03\x04";

// ---------------------------------------------------------------------------
// Public model
// ---------------------------------------------------------------------------

/// Dimension or measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    Dimension,
    Measure,
}

/// One datasource column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    /// Canonical display name (caption, else the bracket-less internal id).
    pub name: String,
    /// Internal identifier as written in the XML, e.g. `[Calculation_123]`.
    pub id: String,
    pub role: FieldRole,
    /// Tableau datatype: `string`, `integer`, `real`, `date`, ...
    pub datatype: String,
    /// Raw formula; present only for calculated fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

impl FieldMetadata {
    pub fn is_calculated(&self) -> bool {
        self.formula.is_some()
    }

    pub fn is_numeric_measure(&self) -> bool {
        self.role == FieldRole::Measure && matches!(self.datatype.as_str(), "integer" | "real")
    }
}

/// One worksheet definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Worksheet {
    pub name: String,
    /// First `title//run` text, if any.
    pub title: Option<String>,
    /// Raw row-shelf expression.
    pub rows: Option<String>,
    /// Raw column-shelf expression.
    pub cols: Option<String>,
    /// Raw `column` attribute of every filter on the sheet.
    pub filters: Vec<String>,
}

/// A dashboard and the names of the zones placed on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dashboard {
    pub name: String,
    pub zones: Vec<String>,
}

/// A filter with optional numeric bounds, anywhere in the workbook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeFilter {
    pub column: String,
    pub min: Option<String>,
    pub max: Option<String>,
}

/// A categorical filter member: `level` names the field, `member` the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterMember {
    pub level: String,
    pub member: String,
}

/// Parsed workbook.
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    fields: Vec<FieldMetadata>,
    by_key: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
    /// Internal id (bracketed and bare) -> caption, for every captioned column.
    captions: HashMap<String, String>,
    pub worksheets: Vec<Worksheet>,
    pub dashboards: Vec<Dashboard>,
    pub range_filters: Vec<RangeFilter>,
    pub members: Vec<FilterMember>,
}

impl Workbook {
    /// Parse workbook bytes: a packaged `.twbx` zip or raw `.twb` XML.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let xml = unpack(bytes)?;
        Self::parse(&xml)
    }

    /// Parse raw workbook XML.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut builder = Builder::default();
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => builder.open(&e, false)?,
                Ok(Event::Empty(e)) => builder.open(&e, true)?,
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| ChartDocError::parse(format!("bad workbook text: {e}")))?;
                    builder.text(&text);
                }
                Ok(Event::CData(t)) => builder.text(&String::from_utf8_lossy(&t)),
                Ok(Event::End(e)) => builder.close(e.name().as_ref()),
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(ChartDocError::parse(format!(
                        "invalid workbook XML at byte {}: {e}",
                        reader.error_position()
                    )));
                }
                _ => {}
            }
        }

        let workbook = builder.finish();
        debug!(
            fields = workbook.fields.len(),
            worksheets = workbook.worksheets.len(),
            dashboards = workbook.dashboards.len(),
            "parsed workbook"
        );
        Ok(workbook)
    }

    /// All datasource fields, in document order.
    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    /// Look a field up by any spelling of its display name.
    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.by_key.get(&norm_key(name)).map(|&i| &self.fields[i])
    }

    /// Look a field up by internal id, bracketed or not.
    pub fn field_by_id(&self, id: &str) -> Option<&FieldMetadata> {
        self.by_id
            .get(id)
            .or_else(|| self.by_id.get(&format!("[{}]", id.trim_matches(['[', ']']))))
            .map(|&i| &self.fields[i])
    }

    /// Internal id -> caption pairs, longest id first.
    pub fn caption_map(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self
            .captions
            .iter()
            .map(|(id, caption)| (id.as_str(), caption.as_str()))
            .collect();
        pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(b.0)));
        pairs
    }

    /// Replace internal ids in `text` with their captions, longest id first.
    ///
    /// Bracketed ids become `[caption]` so formula references stay tokenizable.
    pub fn translate_ids(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (id, caption) in self.caption_map() {
            if !out.contains(id) {
                continue;
            }
            let replacement = if id.starts_with('[') {
                format!("[{caption}]")
            } else {
                caption.to_string()
            };
            out = out.replace(id, &replacement);
        }
        out
    }

    pub fn worksheet(&self, name: &str) -> Option<&Worksheet> {
        self.worksheets.iter().find(|ws| ws.name == name)
    }
}

/// Locate the workbook XML inside `bytes`.
///
/// Zip containers are detected by signature; the first `.twb` entry wins.
pub fn unpack(bytes: &[u8]) -> Result<String> {
    if !bytes.starts_with(ZIP_SIGNATURE) {
        return String::from_utf8(bytes.to_vec())
            .map_err(|e| ChartDocError::parse(format!("workbook is not UTF-8: {e}")));
    }

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ChartDocError::parse(format!("invalid workbook archive: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ChartDocError::parse(format!("unreadable archive entry: {e}")))?;
        if !entry.name().to_ascii_lowercase().ends_with(".twb") {
            continue;
        }
        let name = entry.name().to_string();
        let mut xml = String::new();
        entry
            .read_to_string(&mut xml)
            .map_err(|e| ChartDocError::parse(format!("failed to read {name}: {e}")))?;
        debug!(entry = %name, bytes = xml.len(), "unpacked workbook");
        return Ok(xml);
    }

    Err(ChartDocError::parse("archive contains no .twb document"))
}

// ---------------------------------------------------------------------------
// Streaming builder
// ---------------------------------------------------------------------------

/// Where incoming text should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Title,
    Rows,
    Cols,
    FilterMin,
    FilterMax,
}

#[derive(Default)]
struct Builder {
    stack: Vec<String>,
    workbook: Workbook,
    worksheet: Option<Worksheet>,
    dashboard: Option<Dashboard>,
    /// Index into `workbook.range_filters` of the open `<filter>`.
    filter: Option<usize>,
    /// Column open in a top-level datasource, awaiting its `<calculation>`.
    column: Option<FieldMetadata>,
    capture: Option<(Capture, String)>,
    title_done: bool,
}

impl Builder {
    fn within(&self, tag: &str) -> bool {
        self.stack.iter().any(|t| t == tag)
    }

    fn open(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<()> {
        let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let attrs = attributes(e)?;
        let attr = |key: &str| attrs.get(key).cloned();

        match tag.as_str() {
            "worksheet" if !self.within("dashboard") => {
                self.worksheet = Some(Worksheet {
                    name: attr("name").unwrap_or_default(),
                    ..Worksheet::default()
                });
                self.title_done = false;
            }
            "dashboard" => {
                self.dashboard = Some(Dashboard {
                    name: attr("name").unwrap_or_default(),
                    zones: Vec::new(),
                });
            }
            "zone" => {
                if let (Some(dashboard), Some(name)) = (self.dashboard.as_mut(), attr("name")) {
                    if !dashboard.zones.contains(&name) {
                        dashboard.zones.push(name);
                    }
                }
            }
            "column" => self.open_column(&attrs),
            "calculation" => {
                if let (Some(column), Some(formula)) = (self.column.as_mut(), attr("formula")) {
                    if !formula.trim().is_empty() {
                        column.formula = Some(formula);
                    }
                }
            }
            "filter" => {
                let column = attr("column").unwrap_or_default();
                if let Some(ws) = self.worksheet.as_mut() {
                    if !column.is_empty() {
                        ws.filters.push(column.clone());
                    }
                }
                self.workbook.range_filters.push(RangeFilter {
                    column,
                    min: attr("min"),
                    max: attr("max"),
                });
                if !empty {
                    self.filter = Some(self.workbook.range_filters.len() - 1);
                }
            }
            "min" if self.filter.is_some() => self.capture = Some((Capture::FilterMin, String::new())),
            "max" if self.filter.is_some() => self.capture = Some((Capture::FilterMax, String::new())),
            "run" if self.worksheet.is_some() && self.within("title") && !self.title_done => {
                self.capture = Some((Capture::Title, String::new()));
            }
            "rows" if self.worksheet.is_some() && self.stack.last().is_some_and(|t| t == "table") => {
                self.capture = Some((Capture::Rows, String::new()));
            }
            "cols" if self.worksheet.is_some() && self.stack.last().is_some_and(|t| t == "table") => {
                self.capture = Some((Capture::Cols, String::new()));
            }
            _ => {}
        }

        if let (Some(level), Some(member)) = (attr("level"), attr("member")) {
            self.workbook.members.push(FilterMember { level, member });
        }

        if empty {
            self.close(tag.as_bytes());
        } else {
            self.stack.push(tag);
        }
        Ok(())
    }

    fn open_column(&mut self, attrs: &HashMap<String, String>) {
        let id = attrs.get("name").cloned().unwrap_or_default();
        let caption = attrs
            .get("caption")
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        if let Some(caption) = &caption {
            if !id.is_empty() {
                self.workbook.captions.insert(id.clone(), caption.clone());
                let bare = id.trim_matches(['[', ']']).to_string();
                if bare != *caption {
                    self.workbook.captions.insert(bare, caption.clone());
                }
            }
        }

        // Only top-level datasource columns describe fields; worksheet
        // dependency columns repeat them.
        if self.worksheet.is_some() || !self.within("datasource") {
            return;
        }

        let name = caption.unwrap_or_else(|| id.trim_matches(['[', ']']).to_string());
        if name.is_empty() {
            return;
        }
        let role = match attrs.get("role").map(String::as_str) {
            Some("measure") => FieldRole::Measure,
            _ => FieldRole::Dimension,
        };
        let datatype = attrs
            .get("datatype")
            .cloned()
            .unwrap_or_else(|| "string".to_string());

        self.column = Some(FieldMetadata {
            name,
            id,
            role,
            datatype,
            formula: None,
        });
    }

    fn text(&mut self, text: &str) {
        if let Some((_, buf)) = self.capture.as_mut() {
            buf.push_str(text);
        }
    }

    fn close(&mut self, name: &[u8]) {
        if !self.stack.is_empty() && self.stack.last().is_some_and(|t| t.as_bytes() == name) {
            self.stack.pop();
        }

        match name {
            b"column" => {
                if let Some(column) = self.column.take() {
                    self.add_field(column);
                }
            }
            b"run" | b"rows" | b"cols" | b"min" | b"max" => self.finish_capture(),
            b"filter" => self.filter = None,
            b"worksheet" if !self.within("dashboard") => {
                if let Some(ws) = self.worksheet.take() {
                    self.workbook.worksheets.push(ws);
                }
            }
            b"dashboard" => {
                if let Some(dashboard) = self.dashboard.take() {
                    self.workbook.dashboards.push(dashboard);
                }
            }
            _ => {}
        }
    }

    fn finish_capture(&mut self) {
        let Some((kind, text)) = self.capture.take() else {
            return;
        };
        let text = text.trim().to_string();
        match kind {
            Capture::Title => {
                if let Some(ws) = self.worksheet.as_mut() {
                    if !text.is_empty() {
                        ws.title = Some(text);
                        self.title_done = true;
                    }
                }
            }
            Capture::Rows => {
                if let Some(ws) = self.worksheet.as_mut() {
                    ws.rows = Some(text).filter(|t| !t.is_empty());
                }
            }
            Capture::Cols => {
                if let Some(ws) = self.worksheet.as_mut() {
                    ws.cols = Some(text).filter(|t| !t.is_empty());
                }
            }
            Capture::FilterMin | Capture::FilterMax => {
                let Some(filter) = self.filter.and_then(|i| self.workbook.range_filters.get_mut(i))
                else {
                    return;
                };
                let slot = if kind == Capture::FilterMin {
                    &mut filter.min
                } else {
                    &mut filter.max
                };
                if slot.is_none() && !text.is_empty() {
                    *slot = Some(text);
                }
            }
        }
    }

    fn add_field(&mut self, field: FieldMetadata) {
        let key = norm_key(&field.name);
        // The first definition wins; later datasources often repeat columns.
        if self.workbook.by_key.contains_key(&key) {
            return;
        }
        let index = self.workbook.fields.len();
        self.workbook.by_key.insert(key, index);
        if !field.id.is_empty() {
            self.workbook.by_id.entry(field.id.clone()).or_insert(index);
        }
        self.workbook.fields.push(field);
    }

    fn finish(self) -> Workbook {
        self.workbook
    }
}

fn attributes(e: &BytesStart<'_>) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ChartDocError::parse(format!("bad attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| ChartDocError::parse(format!("bad attribute value: {err}")))?
            .into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A trimmed-down workbook covering every construct the parser reads.
    pub const SOLAR_TWB: &str = r#"<?xml version='1.0' encoding='utf-8' ?>
<workbook version='18.1'>
  <datasources>
    <datasource name='federated.0abc' caption='Installs'>
      <column datatype='string' name='[State]' role='dimension' type='nominal' />
      <column datatype='string' name='[Segment]' role='dimension' type='nominal' />
      <column datatype='real' name='[kW]' role='measure' type='quantitative' />
      <column datatype='date' name='[Install Date]' role='dimension' type='ordinal' />
      <column caption='Capacity' datatype='real' name='[Calculation_111]' role='measure' type='quantitative'>
        <calculation class='tableau' formula='SUM([kW]) / 1000' />
      </column>
      <column caption='Capacity Share' datatype='real' name='[Calculation_222]' role='measure' type='quantitative'>
        <calculation class='tableau' formula='[Calculation_111] /&#13;&#10;   TOTAL([Calculation_111]) * [Segment Weight]' />
      </column>
      <column caption='Segment Weight' datatype='real' name='[Calculation_333]' role='measure' type='quantitative'>
        <calculation class='tableau' formula='IF [Segment] = &quot;Resi&quot; THEN 1 ELSE 0.5 END' />
      </column>
      <column caption='Loop A' datatype='real' name='[Calculation_444]' role='measure' type='quantitative'>
        <calculation class='tableau' formula='[Calculation_555] + 1' />
      </column>
      <column caption='Loop B' datatype='real' name='[Calculation_555]' role='measure' type='quantitative'>
        <calculation class='tableau' formula='[Calculation_444] * 2' />
      </column>
    </datasource>
  </datasources>
  <worksheets>
    <worksheet name='Monthly Output'>
      <layout-options>
        <title>
          <formatted-text><run>Monthly installed capacity</run><run> (MW)</run></formatted-text>
        </title>
      </layout-options>
      <table>
        <view>
          <datasource-dependencies datasource='federated.0abc'>
            <column caption='Capacity' datatype='real' name='[Calculation_111]' role='measure' type='quantitative' />
          </datasource-dependencies>
          <filter class='categorical' column='[federated.0abc].[none:State:nk]'>
            <groupfilter function='union'>
              <groupfilter function='member' level='[none:State:nk]' member='&quot;NSW&quot;' />
              <groupfilter function='member' level='[none:State:nk]' member='&quot;VIC&quot;' />
              <groupfilter function='member' level='[none:State:nk]' member='%null%' />
            </groupfilter>
          </filter>
          <filter class='quantitative' column='[federated.0abc].[sum:kW:qk]' included-values='in-range'>
            <min>0</min>
            <max>500</max>
          </filter>
          <filter class='categorical' column='[federated.0abc].[Action (State)]' />
          <filter class='categorical' column='[federated.0abc].[:Measure Names]' />
        </view>
        <rows>[federated.0abc].[sum:Calculation_111:qk]</rows>
        <cols>[federated.0abc].[tmn:Install Date:ok]</cols>
      </table>
    </worksheet>
    <worksheet name='Regional Split'>
      <table>
        <view>
          <filter class='categorical' column='[federated.0abc].[none:Segment:nk]'>
            <groupfilter function='member' level='[none:Segment:nk]' member='&quot;Commercial&quot;' />
            <groupfilter function='member' level='[none:Segment:nk]' member='&quot;Resi%20Solar&quot;' />
          </filter>
        </view>
        <rows>([federated.0abc].[usr:Calculation_222:qk] * [federated.0abc].[sum:kW:qk])</rows>
        <cols>[federated.0abc].[none:State:nk]</cols>
      </table>
    </worksheet>
  </worksheets>
  <dashboards>
    <dashboard name='Overview Dash'>
      <zones>
        <zone h='100000' id='4' name='Monthly Output' w='50000' />
        <zone h='100000' id='5' name='Regional Split' w='50000' />
        <zone h='100000' id='6' type-v2='text' w='50000' />
      </zones>
    </dashboard>
  </dashboards>
</workbook>
"#;
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::fixtures::SOLAR_TWB;
    use super::*;

    #[test]
    fn parses_datasource_fields() {
        let wb = Workbook::parse(SOLAR_TWB).expect("parse workbook");
        assert_eq!(wb.fields().len(), 9);

        let capacity = wb.field("capacity").expect("capacity field");
        assert_eq!(capacity.id, "[Calculation_111]");
        assert_eq!(capacity.role, FieldRole::Measure);
        assert_eq!(capacity.formula.as_deref(), Some("SUM([kW]) / 1000"));

        let state = wb.field("State").expect("state field");
        assert!(!state.is_calculated());
        assert_eq!(state.role, FieldRole::Dimension);

        assert_eq!(
            wb.field_by_id("Calculation_222").map(|f| f.name.as_str()),
            Some("Capacity Share")
        );
    }

    #[test]
    fn parses_worksheets_and_dashboards() {
        let wb = Workbook::parse(SOLAR_TWB).expect("parse workbook");
        assert_eq!(wb.worksheets.len(), 2);

        let monthly = wb.worksheet("Monthly Output").expect("worksheet");
        assert_eq!(monthly.title.as_deref(), Some("Monthly installed capacity"));
        assert_eq!(
            monthly.rows.as_deref(),
            Some("[federated.0abc].[sum:Calculation_111:qk]")
        );
        assert_eq!(monthly.filters.len(), 4);

        assert_eq!(wb.dashboards.len(), 1);
        assert_eq!(wb.dashboards[0].zones, vec!["Monthly Output", "Regional Split"]);
    }

    #[test]
    fn collects_filter_ranges_and_members() {
        let wb = Workbook::parse(SOLAR_TWB).expect("parse workbook");
        let kw = wb
            .range_filters
            .iter()
            .find(|f| f.column.contains("kW"))
            .expect("kW filter");
        assert_eq!(kw.min.as_deref(), Some("0"));
        assert_eq!(kw.max.as_deref(), Some("500"));

        assert!(wb.members.iter().any(|m| m.member == "\"NSW\""));
    }

    #[test]
    fn translates_ids_longest_first() {
        let wb = Workbook::parse(SOLAR_TWB).expect("parse workbook");
        assert_eq!(
            wb.translate_ids("[Calculation_111] + [Calculation_222]"),
            "[Capacity] + [Capacity Share]"
        );
        assert_eq!(wb.translate_ids("sum:Calculation_111:qk"), "sum:Capacity:qk");
    }

    #[test]
    fn unpacks_zip_container() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("Data/readme.txt", options).expect("start readme");
            writer.write_all(b"not a workbook").expect("write readme");
            writer.start_file("Solar.twb", options).expect("start twb");
            writer.write_all(SOLAR_TWB.as_bytes()).expect("write twb");
            writer.finish().expect("finish zip");
        }
        let bytes = buf.into_inner();
        assert!(bytes.starts_with(ZIP_SIGNATURE));

        let wb = Workbook::from_bytes(&bytes).expect("parse packaged workbook");
        assert!(wb.worksheet("Regional Split").is_some());
    }

    #[test]
    fn raw_xml_passes_through() {
        let xml = unpack(SOLAR_TWB.as_bytes()).expect("unpack xml");
        assert!(xml.starts_with("<?xml"));
    }

    #[test]
    fn zip_without_workbook_is_an_error() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("image.png", zip::write::SimpleFileOptions::default())
                .expect("start file");
            writer.write_all(b"png").expect("write");
            writer.finish().expect("finish");
        }
        let err = unpack(&buf.into_inner()).unwrap_err();
        assert!(err.to_string().contains("no .twb"));
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = Workbook::parse("<workbook><worksheet name='a'></workbook>").unwrap_err();
        assert!(matches!(err, ChartDocError::Parse { .. }));
    }
}
