use serde_json::{Map, Value as Json};

/// RFC 7386 merge patch turning `old` into `new`: changed keys carry their new
/// value, removed keys carry `null`, arrays are replaced whole.
pub fn create_merge_patch(old: &Json, new: &Json) -> Json {
    match (old, new) {
        (Json::Object(o), Json::Object(n)) => Json::Object(diff_maps(o, n)),
        _ => new.clone(),
    }
}

fn diff_maps(old: &Map<String, Json>, new: &Map<String, Json>) -> Map<String, Json> {
    let mut patch = Map::new();
    for (k, nv) in new {
        match old.get(k) {
            None => {
                patch.insert(k.clone(), nv.clone());
            }
            Some(ov) if ov == nv => {}
            Some(Json::Object(o)) => match nv {
                Json::Object(n) => {
                    let sub = diff_maps(o, n);
                    if !sub.is_empty() {
                        patch.insert(k.clone(), Json::Object(sub));
                    }
                }
                _ => {
                    patch.insert(k.clone(), nv.clone());
                }
            },
            Some(_) => {
                patch.insert(k.clone(), nv.clone());
            }
        }
    }
    for k in old.keys() {
        if !new.contains_key(k) {
            patch.insert(k.clone(), Json::Null);
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn removed_keys_become_null() {
        let old = json!({"a": 1, "b": {"c": 1, "d": 2}});
        let new = json!({"b": {"c": 1}});
        assert_eq!(create_merge_patch(&old, &new), json!({"a": null, "b": {"d": null}}));
    }

    #[test]
    fn applying_the_patch_reaches_the_target() {
        let old = json!({"spec": {"replicas": 1, "list": [1, 2, 3], "nested": {"x": "y"}}, "keep": true});
        let new = json!({"spec": {"replicas": 3, "list": [3], "nested": {"z": 1}}, "keep": true, "added": "v"});
        let patch = create_merge_patch(&old, &new);
        let mut applied = old.clone();
        json_patch::merge(&mut applied, &patch);
        assert_eq!(applied, new);
    }

    #[test]
    fn object_replaced_by_scalar() {
        let old = json!({"a": {"b": 1}});
        let new = json!({"a": "flat"});
        assert_eq!(create_merge_patch(&old, &new), json!({"a": "flat"}));
    }
}
