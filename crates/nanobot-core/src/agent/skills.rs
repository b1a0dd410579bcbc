use std::path::{Path, PathBuf};

use regex::Regex;

const MAX_SKILL_CHARS: usize = 12_000;
const MAX_SKILLS_TOTAL_CHARS: usize = 60_000;

/// A loaded skill: a markdown instruction file under `<workspace>/skills`.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub display_name: String,
    pub path: PathBuf,
    pub body: String,
}

/// Recursively collect skills from a directory.
///
/// A skill is any `*.md` file whose name does not start with `_`, or a
/// `SKILL.md` inside a subdirectory (the skill takes the directory's name).
pub fn load_skills(skills_dir: &Path) -> Vec<Skill> {
    let mut skills = Vec::new();
    if skills_dir.is_dir() {
        walk(skills_dir, &mut skills);
    }
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

fn walk(dir: &Path, out: &mut Vec<Skill>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out);
            continue;
        }

        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if !file_name.to_lowercase().ends_with(".md") || file_name.starts_with('_') {
            continue;
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => continue,
        };

        let name = infer_skill_name(&path);
        let (title, body) = extract_title_and_body(&content);
        let display_name = if title.is_empty() { name.clone() } else { title };

        let mut body = body.trim().to_string();
        if body.is_empty() {
            body = "(empty skill)".into();
        }
        let body = truncate_chars(&body, MAX_SKILL_CHARS, "\n\n... (skill truncated)");

        out.push(Skill {
            name: name.to_lowercase(),
            display_name,
            path,
            body,
        });
    }
}

fn infer_skill_name(path: &Path) -> String {
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if base.eq_ignore_ascii_case("SKILL.md") {
        return path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

fn extract_title_and_body(content: &str) -> (String, String) {
    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(title) = trimmed.strip_prefix("# ") {
            let body = content
                .lines()
                .skip(i + 1)
                .collect::<Vec<_>>()
                .join("\n");
            return (title.trim().to_string(), body);
        }
        break;
    }
    (String::new(), content.to_string())
}

fn truncate_chars(s: &str, limit: usize, suffix: &str) -> String {
    if limit == 0 || s.chars().count() <= limit {
        return s.to_string();
    }
    let cut: String = s.chars().take(limit).collect();
    format!("{}{suffix}", cut.trim_end())
}

/// Filter loaded skills by `@skill:<name>` references in the user message.
///
/// `@skill:all` keeps everything, `@skill:none` drops everything, and
/// specific names restrict to the named intersection. No references means
/// all skills stay.
pub fn filter_skills_by_refs(skills: Vec<Skill>, message: &str) -> Vec<Skill> {
    let re = Regex::new(r"(?i)@skill:([a-z0-9_.-]+)").unwrap();

    let mut wanted = std::collections::HashSet::new();
    let mut any = false;
    for cap in re.captures_iter(message) {
        let reference = cap[1].trim().to_lowercase();
        if reference.is_empty() {
            continue;
        }
        any = true;
        if reference == "all" {
            return skills;
        }
        if reference == "none" {
            return Vec::new();
        }
        wanted.insert(reference);
    }

    if !any || wanted.is_empty() {
        return skills;
    }

    skills
        .into_iter()
        .filter(|s| wanted.contains(&s.name))
        .collect()
}

/// Render the skills section for the system prompt, capped in total size.
pub fn build_skills_section(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }

    let mut out = String::from("## Skills\n");
    let mut used = 0usize;
    for skill in skills {
        let section = format!("### {}\n{}\n\n", skill.display_name, skill.body);
        let section_chars = section.chars().count();
        if used + section_chars > MAX_SKILLS_TOTAL_CHARS {
            out.push_str("... (skills truncated)\n");
            break;
        }
        out.push_str(&section);
        used += section_chars;
    }

    out.trim_end().to_string()
}
