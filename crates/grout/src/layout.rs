//! Folder layout derived from the user's directory mappings

use grout_config::{Config, FolderTable};
use std::collections::BTreeSet;
use std::path::Path;

/// Build a layout rooted at `base_path` from the configured ROM and save
/// folder mappings. Platforms without a ROM mapping use their slug.
pub fn from_config(base_path: &Path, config: &Config) -> FolderTable {
    let slugs: BTreeSet<&str> = config
        .directory_mappings
        .keys()
        .chain(config.save_directory_mappings.keys())
        .map(String::as_str)
        .collect();

    slugs.into_iter().fold(FolderTable::new(base_path, base_path), |table, slug| {
        let roms = config
            .directory_mappings
            .get(slug)
            .map(|m| m.relative_path.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or(slug);
        let saves: Vec<&str> = config
            .save_directory_mappings
            .get(slug)
            .map(String::as_str)
            .into_iter()
            .collect();
        table.with_platform(slug, &[roms], &saves)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use grout_config::{CfwLayout, DirectoryMapping};

    #[test]
    fn test_layout_from_mappings() {
        let mut config = Config::default();
        config.directory_mappings.insert(
            "gba".into(),
            DirectoryMapping {
                slug: "gba".into(),
                relative_path: "Roms/GBA".into(),
            },
        );
        config.save_directory_mappings.insert("gba".into(), "Saves/GBA".into());
        config.save_directory_mappings.insert("snes".into(), "Saves/SFC".into());

        let layout = from_config(Path::new("/mnt/SDCARD"), &config);

        assert_eq!(layout.platform_slugs().len(), 2);
        assert_eq!(layout.rom_folders("gba"), vec!["Roms/GBA".to_string()]);
        assert_eq!(layout.save_folders("gba"), vec!["Saves/GBA".to_string()]);
        assert_eq!(layout.rom_folders("snes"), vec!["snes".to_string()]);
        assert_eq!(layout.save_root(), Path::new("/mnt/SDCARD"));
    }

    #[test]
    fn test_platform_without_save_mapping() {
        let mut config = Config::default();
        config.directory_mappings.insert(
            "psx".into(),
            DirectoryMapping {
                slug: "psx".into(),
                relative_path: String::new(),
            },
        );

        let layout = from_config(Path::new("/userdata"), &config);
        assert_eq!(layout.rom_folders("psx"), vec!["psx".to_string()]);
        assert!(layout.save_folders("psx").is_empty());
    }
}
