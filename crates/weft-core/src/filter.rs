use crate::config::AnalysisConfig;

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include_paths: Vec<String>,
    exclude_paths: Vec<String>,
    include_extensions: Vec<String>,
    exclude_extensions: Vec<String>,
}

impl PathFilter {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let normalize_ext = |values: &[String]| {
            values
                .iter()
                .map(|value| value.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|value| !value.is_empty())
                .collect::<Vec<_>>()
        };
        let normalize_glob = |values: &[String]| {
            values
                .iter()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .collect::<Vec<_>>()
        };

        Self {
            include_paths: normalize_glob(&config.include_paths),
            exclude_paths: normalize_glob(&config.exclude_paths),
            include_extensions: normalize_ext(&config.include_extensions),
            exclude_extensions: normalize_ext(&config.exclude_extensions),
        }
    }

    pub fn accepts(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }

        if !self.include_extensions.is_empty() || !self.exclude_extensions.is_empty() {
            let extension = extension_of(path);
            if self
                .exclude_extensions
                .iter()
                .any(|excluded| Some(excluded.as_str()) == extension)
            {
                return false;
            }
            if !self.include_extensions.is_empty()
                && !self
                    .include_extensions
                    .iter()
                    .any(|included| Some(included.as_str()) == extension)
            {
                return false;
            }
        }

        let file_name = path.rsplit('/').next().unwrap_or(path);
        let matches_any = |patterns: &[String]| {
            patterns.iter().any(|pattern| {
                wildcard_match(pattern, path)
                    || (!pattern.contains('/') && wildcard_match(pattern, file_name))
            })
        };

        if matches_any(&self.exclude_paths) {
            return false;
        }
        if !self.include_paths.is_empty() && !matches_any(&self.include_paths) {
            return false;
        }

        true
    }
}

fn extension_of(path: &str) -> Option<&str> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    match file_name.rsplit_once('.') {
        Some(("", _)) => None,
        Some((_, extension)) if !extension.is_empty() => Some(extension),
        _ => None,
    }
}

pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let mut previous = vec![false; text.len() + 1];
    let mut current = vec![false; text.len() + 1];
    previous[0] = true;

    for &token in pattern {
        current[0] = token == b'*' && previous[0];
        for index in 1..=text.len() {
            current[index] = match token {
                b'*' => current[index - 1] || previous[index],
                b'?' => previous[index - 1],
                _ => previous[index - 1] && token == text[index - 1],
            };
        }
        std::mem::swap(&mut previous, &mut current);
        current.fill(false);
    }

    previous[text.len()]
}
