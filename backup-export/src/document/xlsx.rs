//! Streaming XLSX workbook writer.
//!
//! Worksheets are written straight into deflated zip entries as rows arrive,
//! using inline strings so nothing accumulates between rows. The workbook
//! parts that list every sheet are written at `finish`, once the sheet set is
//! known.

use std::fmt::Write as _;
use std::io::Write;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::xml::{column_name, escape, escape_into, excel_serial, SheetNames, MAX_CELL_TEXT, MAX_ROWS};
use crate::model::{CellValue, Record};
use crate::utils::errors::{ExportError, Result};

const NS_MAIN: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const NS_REL: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

const STYLE_HEADER: u8 = 1;
const STYLE_TIMESTAMP: u8 = 2;
const MIN_COLUMN_WIDTH: usize = 15;

const STYLES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><numFmts count="1"><numFmt numFmtId="164" formatCode="yyyy\-mm\-dd\ hh:mm:ss"/></numFmts><fonts count="2"><font><sz val="11"/><name val="Calibri"/><family val="2"/></font><font><b/><sz val="11"/><color rgb="FFFFFFFF"/><name val="Calibri"/><family val="2"/></font></fonts><fills count="3"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill><fill><patternFill patternType="solid"><fgColor rgb="FF4472C4"/><bgColor indexed="64"/></patternFill></fill></fills><borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="3"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/><xf numFmtId="0" fontId="1" fillId="2" borderId="0" xfId="0" applyFont="1" applyFill="1" applyAlignment="1"><alignment horizontal="center" vertical="center"/></xf><xf numFmtId="164" fontId="0" fillId="0" borderId="0" xfId="0" applyNumberFormat="1"/></cellXfs><cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles></styleSheet>"#;

/// What was written for one section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetSummary {
    pub section: String,
    pub sheet_name: String,
    pub columns: usize,
    pub rows: usize,
    /// Rows whose fields differed from the header and were projected onto it.
    pub projected_rows: usize,
}

struct SheetEntry {
    name: String,
    columns: usize,
}

pub struct WorkbookWriter<W: Write> {
    zip: ZipWriter<zip::write::StreamWriter<W>>,
    options: SimpleFileOptions,
    names: SheetNames,
    sheets: Vec<SheetEntry>,
    line: String,
}

impl<W: Write> WorkbookWriter<W> {
    pub fn new(inner: W) -> Self {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(false);
        Self {
            zip: ZipWriter::new_stream(inner),
            options,
            names: SheetNames::default(),
            sheets: Vec::new(),
            line: String::with_capacity(4096),
        }
    }

    pub fn sheet_count(&self) -> usize {
        self.sheets.len()
    }

    /// Write one non-empty section as a worksheet. The header is the first
    /// record's field names; every row is emitted with exactly those columns.
    pub fn write_sheet(&mut self, section: &str, records: &[Record]) -> Result<SheetSummary> {
        let first = records.first().ok_or_else(|| {
            ExportError::Document(format!("section {} has no records to write", section))
        })?;
        if records.len() + 1 > MAX_ROWS {
            return Err(ExportError::Document(format!(
                "section {} has {} rows, more than a worksheet holds",
                section,
                records.len()
            )));
        }
        let header: Vec<&str> = first.field_names().collect();
        if header.is_empty() {
            return Err(ExportError::Document(format!(
                "section {} returned records without fields",
                section
            )));
        }

        let sheet_name = self.names.assign(section);
        let index = self.sheets.len() + 1;
        self.zip
            .start_file(format!("xl/worksheets/sheet{}.xml", index), self.options)?;

        self.write_sheet_head(&header)?;

        let mut projected_rows = 0;
        for (offset, record) in records.iter().enumerate() {
            let same_layout = record.len() == header.len()
                && record.field_names().zip(&header).all(|(a, b)| a == *b);
            if !same_layout {
                if projected_rows == 0 {
                    tracing::warn!(
                        section,
                        row = offset + 1,
                        "record fields differ from the header; projecting onto header columns"
                    );
                }
                projected_rows += 1;
            }

            let row = offset + 2;
            self.line.clear();
            let _ = write!(self.line, r#"<row r="{}">"#, row);
            if same_layout {
                for (col, (_, value)) in record.fields().enumerate() {
                    push_cell(&mut self.line, col, row, value);
                }
            } else {
                for (col, name) in header.iter().enumerate() {
                    if let Some(value) = record.get(name) {
                        push_cell(&mut self.line, col, row, value);
                    }
                }
            }
            self.line.push_str("</row>");
            self.zip.write_all(self.line.as_bytes())?;
        }

        let last_col = column_name(header.len() - 1);
        self.line.clear();
        let _ = write!(
            self.line,
            r#"</sheetData><autoFilter ref="A1:{}1"/></worksheet>"#,
            last_col
        );
        self.zip.write_all(self.line.as_bytes())?;

        self.sheets.push(SheetEntry {
            name: sheet_name.clone(),
            columns: header.len(),
        });

        Ok(SheetSummary {
            section: section.to_string(),
            sheet_name,
            columns: header.len(),
            rows: records.len(),
            projected_rows,
        })
    }

    fn write_sheet_head(&mut self, header: &[&str]) -> Result<()> {
        let out = &mut self.line;
        out.clear();
        let _ = write!(
            out,
            r#"{}<worksheet xmlns="{}" xmlns:r="{}"><sheetViews><sheetView workbookViewId="0"><pane ySplit="1" topLeftCell="A2" activePane="bottomLeft" state="frozen"/><selection pane="bottomLeft" activeCell="A2" sqref="A2"/></sheetView></sheetViews><sheetFormatPr defaultRowHeight="15"/><cols>"#,
            XML_DECL, NS_MAIN, NS_REL
        );
        for (idx, name) in header.iter().enumerate() {
            let width = (name.chars().count() + 2).max(MIN_COLUMN_WIDTH);
            let _ = write!(
                out,
                r#"<col min="{0}" max="{0}" width="{1}" customWidth="1"/>"#,
                idx + 1,
                width
            );
        }
        out.push_str(r#"</cols><sheetData><row r="1">"#);
        for (idx, name) in header.iter().enumerate() {
            let _ = write!(out, r#"<c r="{}1" t="inlineStr" s="{}"><is><t>"#, column_name(idx), STYLE_HEADER);
            escape_into(out, name);
            out.push_str("</t></is></c>");
        }
        out.push_str("</row>");
        self.zip.write_all(self.line.as_bytes())?;
        Ok(())
    }

    /// Write the workbook parts and the zip central directory. Returns the
    /// underlying stream so the caller can flush it.
    pub fn finish(mut self) -> Result<impl Write> {
        if self.sheets.is_empty() {
            // A workbook needs at least one sheet to open.
            self.zip.start_file("xl/worksheets/sheet1.xml", self.options)?;
            let blank = format!(
                r#"{}<worksheet xmlns="{}"><sheetData/></worksheet>"#,
                XML_DECL, NS_MAIN
            );
            self.zip.write_all(blank.as_bytes())?;
            self.sheets.push(SheetEntry {
                name: self.names.assign("Sheet1"),
                columns: 0,
            });
        }

        self.zip.start_file("xl/styles.xml", self.options)?;
        self.zip.write_all(STYLES_XML.as_bytes())?;

        self.zip.start_file("xl/workbook.xml", self.options)?;
        let workbook = self.workbook_xml();
        self.zip.write_all(workbook.as_bytes())?;

        self.zip.start_file("xl/_rels/workbook.xml.rels", self.options)?;
        let rels = self.workbook_rels_xml();
        self.zip.write_all(rels.as_bytes())?;

        self.zip.start_file("_rels/.rels", self.options)?;
        let root_rels = format!(
            r#"{}<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="{}/officeDocument" Target="xl/workbook.xml"/></Relationships>"#,
            XML_DECL, NS_REL
        );
        self.zip.write_all(root_rels.as_bytes())?;

        self.zip.start_file("[Content_Types].xml", self.options)?;
        let content_types = self.content_types_xml();
        self.zip.write_all(content_types.as_bytes())?;

        Ok(self.zip.finish()?)
    }

    fn workbook_xml(&self) -> String {
        let mut out = format!(
            r#"{}<workbook xmlns="{}" xmlns:r="{}"><bookViews><workbookView/></bookViews><sheets>"#,
            XML_DECL, NS_MAIN, NS_REL
        );
        for (idx, sheet) in self.sheets.iter().enumerate() {
            let _ = write!(
                out,
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                escape(&sheet.name),
                idx + 1,
                idx + 1
            );
        }
        out.push_str("</sheets>");

        let filtered: Vec<_> = self
            .sheets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.columns > 0)
            .collect();
        if !filtered.is_empty() {
            out.push_str("<definedNames>");
            for (idx, sheet) in filtered {
                let quoted = sheet.name.replace('\'', "''");
                let _ = write!(
                    out,
                    r#"<definedName name="_xlnm._FilterDatabase" localSheetId="{}" hidden="1">"#,
                    idx
                );
                escape_into(
                    &mut out,
                    &format!("'{}'!$A$1:${}$1", quoted, column_name(sheet.columns - 1)),
                );
                out.push_str("</definedName>");
            }
            out.push_str("</definedNames>");
        }
        out.push_str("</workbook>");
        out
    }

    fn workbook_rels_xml(&self) -> String {
        let mut out = format!(
            r#"{}<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
            XML_DECL
        );
        for idx in 1..=self.sheets.len() {
            let _ = write!(
                out,
                r#"<Relationship Id="rId{0}" Type="{1}/worksheet" Target="worksheets/sheet{0}.xml"/>"#,
                idx, NS_REL
            );
        }
        let _ = write!(
            out,
            r#"<Relationship Id="rId{}" Type="{}/styles" Target="styles.xml"/></Relationships>"#,
            self.sheets.len() + 1,
            NS_REL
        );
        out
    }

    fn content_types_xml(&self) -> String {
        let mut out = format!(
            r#"{}<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>"#,
            XML_DECL
        );
        for idx in 1..=self.sheets.len() {
            let _ = write!(
                out,
                r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#,
                idx
            );
        }
        out.push_str("</Types>");
        out
    }
}

fn push_cell(out: &mut String, col: usize, row: usize, value: &CellValue) {
    let cell_ref = format!("{}{}", column_name(col), row);
    match value {
        CellValue::Null => {}
        CellValue::Bool(b) => {
            let _ = write!(out, r#"<c r="{}" t="b"><v>{}</v></c>"#, cell_ref, u8::from(*b));
        }
        CellValue::Integer(i) => {
            let _ = write!(out, r#"<c r="{}"><v>{}</v></c>"#, cell_ref, i);
        }
        CellValue::Float(f) if f.is_finite() => {
            let _ = write!(out, r#"<c r="{}"><v>{}</v></c>"#, cell_ref, f);
        }
        CellValue::Float(f) => push_text(out, &cell_ref, &f.to_string()),
        CellValue::Timestamp(ts) => {
            let _ = write!(
                out,
                r#"<c r="{}" s="{}"><v>{}</v></c>"#,
                cell_ref,
                STYLE_TIMESTAMP,
                excel_serial(ts)
            );
        }
        CellValue::Text(s) => push_text(out, &cell_ref, s),
    }
}

fn push_text(out: &mut String, cell_ref: &str, text: &str) {
    let text = match text.char_indices().nth(MAX_CELL_TEXT) {
        Some((cut, _)) => &text[..cut],
        None => text,
    };
    let preserve = text.starts_with(char::is_whitespace) || text.ends_with(char::is_whitespace);
    let _ = write!(out, r#"<c r="{}" t="inlineStr"><is><t"#, cell_ref);
    if preserve {
        out.push_str(r#" xml:space="preserve""#);
    }
    out.push('>');
    escape_into(out, text);
    out.push_str("</t></is></c>");
}
