//! Flat markdown section extraction.
//!
//! Model replies are markdown with a handful of `##` headings. This does not
//! perform full parsing; it splits on heading lines, ignoring anything that
//! looks like a heading inside a fenced code block.

#[derive(Debug)]
pub struct MarkdownFlatParser {
    sections: Vec<(String, String)>,
}

impl MarkdownFlatParser {
    /// Split `input` into sections introduced by lines starting with
    /// `marker_prefix` (e.g. `##` or `**`). Heading matching is
    /// case-insensitive.
    pub fn parse(input: &str, marker_prefix: &str) -> Self {
        let mut sections: Vec<(String, String)> = Vec::new();
        let mut current_header: Option<String> = None;
        let mut current_content: Vec<&str> = Vec::new();
        let mut in_code_block = false;

        let store =
            |header: Option<String>, content: &mut Vec<&str>, out: &mut Vec<(String, String)>| {
                if let Some(header) = header {
                    out.push((header, content.join("\n").trim().to_string()));
                }
                content.clear();
            };

        for line in input.lines() {
            if line.trim().starts_with("```") {
                in_code_block = !in_code_block;
                if current_header.is_some() {
                    current_content.push(line);
                }
                continue;
            }

            if !in_code_block && line.starts_with(marker_prefix) {
                let header = line[marker_prefix.len()..]
                    .trim()
                    .trim_end_matches(marker_prefix.chars().next().unwrap_or('#'))
                    .trim()
                    .to_lowercase();
                if !header.is_empty() {
                    store(current_header.take(), &mut current_content, &mut sections);
                    current_header = Some(header);
                    continue;
                }
            }

            if current_header.is_some() {
                current_content.push(line);
            }
        }
        store(current_header.take(), &mut current_content, &mut sections);

        MarkdownFlatParser { sections }
    }

    /// Content of the section whose heading equals `header`
    /// (case-insensitive), or `None`.
    pub fn section(&self, header: &str) -> Option<&str> {
        let wanted = header.to_lowercase();
        self.sections
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, content)| content.as_str())
    }

    /// Content of the first section whose heading contains `header`.
    pub fn section_fuzzy(&self, header: &str) -> Option<&str> {
        let wanted = header.to_lowercase();
        self.sections
            .iter()
            .find(|(name, _)| name.contains(&wanted))
            .map(|(_, content)| content.as_str())
    }

    pub fn headers(&self) -> Vec<&str> {
        self.sections.iter().map(|(name, _)| name.as_str()).collect()
    }
}
