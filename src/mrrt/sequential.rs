use crate::mr::{Group, KeyMultiValue, KeyValue, MRApp, MrError, Phase};

/// Runs the whole pipeline on the calling thread: every task in id order,
/// grouping by sorting the intermediate pairs.
pub fn run(app: &dyn MRApp, ntasks: u64) -> Result<KeyValue, MrError> {
    let mut intermediate = KeyValue::new();
    for task_id in 0..ntasks {
        app.map(task_id, &mut intermediate)
            .map_err(|e| MrError::callback(Phase::Map, e.context(format!("map task {task_id}"))))?;
    }

    let mut pairs: Vec<(&[u8], &[u8])> = intermediate.iter().collect();
    // stable, so values keep task order within a key
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut groups: Vec<Group> = Vec::new();
    for (key, value) in pairs {
        match groups.last_mut() {
            Some(group) if group.key == key => {
                group.multivalue.extend_from_slice(value);
                group.lengths.push(value.len() as u32);
            }
            _ => groups.push(Group {
                key: key.to_vec(),
                multivalue: value.to_vec(),
                lengths: vec![value.len() as u32],
            }),
        }
    }
    let kmv = KeyMultiValue::from_groups(groups)?;

    let mut out = KeyValue::new();
    for group in &kmv {
        app.reduce(group.key(), group.values(), &mut out)
            .map_err(|e| MrError::callback(Phase::Reduce, e))?;
    }
    Ok(out)
}
