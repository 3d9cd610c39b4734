//! Helpers for reading `Vec<Vec<String>>` tag lists.

use std::collections::HashSet;
use std::str::FromStr;

pub fn tag_name(tag: &[String]) -> Option<&str> {
    tag.first().map(String::as_str)
}

pub fn tag_field(tag: &[String], index: usize) -> Option<&str> {
    tag.get(index).map(String::as_str)
}

pub fn is_tag(tag: &[String], name: &str) -> bool {
    matches!(tag_name(tag), Some(tag_name) if tag_name == name)
}

/// First tag named `name` that carries a value.
pub fn find_tag<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a [String]> {
    tags.iter()
        .find(|tag| is_tag(tag, name) && tag_field(tag, 1).is_some())
        .map(Vec::as_slice)
}

pub fn find_tag_value<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    find_tag(tags, name).and_then(|tag| tag_field(tag, 1))
}

pub fn collect_tag_values(tags: &[Vec<String>], name: &str) -> Vec<String> {
    tags.iter()
        .filter(|tag| is_tag(tag, name))
        .filter_map(|tag| tag_field(tag, 1).map(str::to_owned))
        .collect()
}

/// Like [`collect_tag_values`] but keeps only the first occurrence of each value.
pub fn unique_tag_values(tags: &[Vec<String>], name: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    collect_tag_values(tags, name)
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

pub fn parse_tag_field<T>(tag: &[String], index: usize) -> Option<T>
where
    T: FromStr,
{
    tag_field(tag, index).and_then(|value| value.parse::<T>().ok())
}

pub fn parse_tag_value<T>(tags: &[Vec<String>], name: &str) -> Option<T>
where
    T: FromStr,
{
    find_tag(tags, name).and_then(|tag| parse_tag_field(tag, 1))
}
