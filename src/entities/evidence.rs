/// Who can see a piece of evidence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvidenceVisibility {
    /// Everyone in the area.
    All,
    /// Only sessions standing at one of these positions (stewards and
    /// moderators always see everything).
    Positions(Vec<String>),
}

impl Default for EvidenceVisibility {
    fn default() -> Self {
        EvidenceVisibility::All
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evidence {
    pub name: String,
    pub description: String,
    pub image: String,
    pub visibility: EvidenceVisibility,
}

impl Evidence {
    pub fn new(name: String, description: String, image: String) -> Self {
        Self {
            name,
            description,
            image,
            visibility: EvidenceVisibility::All,
        }
    }

    pub fn visible_from(&self, position: Option<&str>, privileged: bool) -> bool {
        if privileged {
            return true;
        }
        match &self.visibility {
            EvidenceVisibility::All => true,
            EvidenceVisibility::Positions(allowed) => match position {
                Some(pos) => allowed.iter().any(|entry| entry == pos),
                None => false,
            },
        }
    }

    /// Wire form: subfields joined by `&` inside a single argument.
    pub fn to_wire(&self) -> String {
        format!("{}&{}&{}", self.name, self.description, self.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evidence_visible_to_all_by_default() {
        let item = Evidence::new("Knife".into(), "Exhibit A".into(), "knife.png".into());
        assert!(item.visible_from(None, false));
        assert!(item.visible_from(Some("wit"), false));
    }

    #[test]
    fn positional_evidence_hidden_from_other_positions() {
        let mut item = Evidence::new("Note".into(), "private".into(), "note.png".into());
        item.visibility = EvidenceVisibility::Positions(vec!["def".to_string()]);
        assert!(item.visible_from(Some("def"), false));
        assert!(!item.visible_from(Some("pro"), false));
        assert!(!item.visible_from(None, false));
        // Stewards and moderators bypass the filter.
        assert!(item.visible_from(Some("pro"), true));
    }

    #[test]
    fn wire_form_joins_subfields() {
        let item = Evidence::new("Knife".into(), "Exhibit A".into(), "knife.png".into());
        assert_eq!(item.to_wire(), "Knife&Exhibit A&knife.png");
    }
}
